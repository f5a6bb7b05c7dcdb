//! Inbound command dispatch
//!
//! Commands arrive on the `{OID}/commands/{ID}` topic with their name in the
//! `commandName` user property. Handlers are registered per name, plus at most one
//! untyped handler that sees every command as a key/value bag.

use crate::transport::InboundMessage;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tracing::{debug, error, warn};

/// User property carrying the command name
pub const COMMAND_NAME_PROPERTY: &str = "commandName";

const COMMAND_SUFFIX: &str = "command";

/// Command dispatch errors
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("Command message on {topic} has no command name")]
    MissingName { topic: String },
    #[error("Payload for {command} could not be decoded: {source}")]
    Decode {
        command: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Arguments bag handed to the untyped handler
pub type CommandArguments = HashMap<String, Value>;

type UntypedHandler = Arc<dyn Fn(&str, CommandArguments) + Send + Sync>;
type TypedInvoker = Arc<dyn Fn(&str, &[u8]) -> Result<(), CommandError> + Send + Sync>;

struct TypedEntry {
    name: String,
    invoke: TypedInvoker,
}

/// What a dispatch actually ran
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchOutcome {
    pub untyped_invoked: bool,
    pub typed_invoked: bool,
}

/// Lowercase, trimmed, with an optional trailing `command` removed
pub fn normalize_command_name(name: &str) -> String {
    let lower = name.trim().to_lowercase();
    match lower.strip_suffix(COMMAND_SUFFIX) {
        Some(stem) if !stem.is_empty() => stem.to_string(),
        _ => lower,
    }
}

/// `None` for absent, blank or JSON `null` payloads
fn meaningful_payload(payload: &[u8]) -> Option<&[u8]> {
    let start = payload
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(payload.len());
    let end = payload
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |i| i + 1);
    let trimmed = &payload[start..end];
    if trimmed.is_empty() || trimmed == b"null" {
        None
    } else {
        Some(trimmed)
    }
}

/// Routes inbound command messages to registered handlers
#[derive(Default)]
pub struct CommandDispatcher {
    typed: RwLock<HashMap<String, TypedEntry>>,
    untyped: RwLock<Option<UntypedHandler>>,
}

impl CommandDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for one command name, replacing any previous one
    ///
    /// The payload is decoded into `T`; an absent or empty payload yields
    /// `T::default()`. Handlers run on the inbound router task, so long work should
    /// be spawned.
    pub fn subscribe<T, F>(&self, name: &str, handler: F)
    where
        T: DeserializeOwned + Default + 'static,
        F: Fn(T) + Send + Sync + 'static,
    {
        let invoke: TypedInvoker = Arc::new(move |command: &str, payload: &[u8]| {
            let args = match meaningful_payload(payload) {
                None => T::default(),
                Some(bytes) => serde_json::from_slice::<T>(bytes).map_err(|source| {
                    CommandError::Decode {
                        command: command.to_string(),
                        source,
                    }
                })?,
            };
            handler(args);
            Ok(())
        });

        let key = normalize_command_name(name);
        let previous = self
            .typed
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(
                key,
                TypedEntry {
                    name: name.to_string(),
                    invoke,
                },
            );
        if previous.is_some() {
            debug!(command = %name, "Replaced command handler");
        }
    }

    /// Register the catch-all handler, replacing any previous one
    pub fn subscribe_untyped<F>(&self, handler: F)
    where
        F: Fn(&str, CommandArguments) + Send + Sync + 'static,
    {
        *self.untyped.write().unwrap_or_else(|p| p.into_inner()) = Some(Arc::new(handler));
    }

    pub fn unsubscribe(&self, name: &str) -> bool {
        self.typed
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&normalize_command_name(name))
            .is_some()
    }

    pub fn unsubscribe_untyped(&self) -> bool {
        self.untyped
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .take()
            .is_some()
    }

    /// Names of registered typed handlers as they were registered, sorted
    pub fn registered_commands(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .typed
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .values()
            .map(|entry| entry.name.clone())
            .collect();
        names.sort();
        names
    }

    /// Dispatch one inbound message
    ///
    /// The untyped handler runs first. A decode failure only skips the handler it
    /// affects.
    pub fn dispatch(&self, message: &InboundMessage) -> Result<DispatchOutcome, CommandError> {
        let Some(command) = message
            .property(COMMAND_NAME_PROPERTY)
            .filter(|name| !name.trim().is_empty())
        else {
            error!(topic = %message.topic, "Command message without a command name dropped");
            return Err(CommandError::MissingName {
                topic: message.topic.clone(),
            });
        };

        let mut outcome = DispatchOutcome::default();

        let untyped = self
            .untyped
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone();
        if let Some(handler) = untyped {
            match decode_arguments(&message.payload) {
                Ok(arguments) => {
                    handler(command, arguments);
                    outcome.untyped_invoked = true;
                }
                Err(source) => {
                    warn!(command = %command, error = %source, "Untyped command payload is not an object");
                }
            }
        }

        let typed = self
            .typed
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(&normalize_command_name(command))
            .map(|entry| entry.invoke.clone());
        match typed {
            Some(invoke) => match invoke(command, &message.payload) {
                Ok(()) => outcome.typed_invoked = true,
                Err(e) => warn!(command = %command, error = %e, "Command handler skipped"),
            },
            None => debug!(command = %command, "No typed handler registered"),
        }

        Ok(outcome)
    }
}

fn decode_arguments(payload: &[u8]) -> Result<CommandArguments, serde_json::Error> {
    match meaningful_payload(payload) {
        None => Ok(CommandArguments::new()),
        Some(bytes) => serde_json::from_slice(bytes),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::sync::Mutex;

    #[derive(Debug, Default, Deserialize, PartialEq, Clone)]
    struct Delay {
        #[serde(default)]
        seconds: u32,
    }

    fn command(name: &str, payload: &str) -> InboundMessage {
        InboundMessage::new("org/commands/DEV1", payload.as_bytes().to_vec())
            .with_property(COMMAND_NAME_PROPERTY, name)
    }

    #[test]
    fn test_normalize_command_name() {
        assert_eq!(normalize_command_name("Restart"), "restart");
        assert_eq!(normalize_command_name("RestartCommand"), "restart");
        assert_eq!(normalize_command_name(" RESTARTCOMMAND "), "restart");
        assert_eq!(normalize_command_name("Command"), "command");
    }

    #[test]
    fn test_typed_handler_decodes_payload() {
        let dispatcher = CommandDispatcher::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        dispatcher.subscribe("Delay", move |args: Delay| sink.lock().unwrap().push(args));

        let outcome = dispatcher.dispatch(&command("delay", r#"{"seconds":7}"#)).unwrap();
        assert!(outcome.typed_invoked);
        assert_eq!(*seen.lock().unwrap(), vec![Delay { seconds: 7 }]);
    }

    #[test]
    fn test_suffix_tolerated_both_ways() {
        let dispatcher = CommandDispatcher::new();
        let count = Arc::new(Mutex::new(0));
        let sink = count.clone();
        dispatcher.subscribe("RebootCommand", move |_: Delay| *sink.lock().unwrap() += 1);

        dispatcher.dispatch(&command("reboot", "")).unwrap();
        dispatcher.dispatch(&command("REBOOTCOMMAND", "")).unwrap();
        assert_eq!(*count.lock().unwrap(), 2);
    }

    #[test]
    fn test_decode_failure_skips_only_typed_handler() {
        let dispatcher = CommandDispatcher::new();
        let untyped = Arc::new(Mutex::new(0));
        let sink = untyped.clone();
        dispatcher.subscribe_untyped(move |_, _| *sink.lock().unwrap() += 1);
        dispatcher.subscribe("Delay", |_: Delay| panic!("must not run"));

        let outcome = dispatcher
            .dispatch(&command("Delay", r#"{"seconds":"soon"}"#))
            .unwrap();
        assert!(outcome.untyped_invoked);
        assert!(!outcome.typed_invoked);
        assert_eq!(*untyped.lock().unwrap(), 1);
    }

    #[test]
    fn test_untyped_decode_failure_still_runs_typed() {
        let dispatcher = CommandDispatcher::new();
        dispatcher.subscribe_untyped(|_, _| panic!("must not run"));
        let seen = Arc::new(Mutex::new(0));
        let sink = seen.clone();
        dispatcher.subscribe("List", move |_: Vec<u32>| *sink.lock().unwrap() += 1);

        let outcome = dispatcher.dispatch(&command("List", "[1,2,3]")).unwrap();
        assert!(!outcome.untyped_invoked);
        assert!(outcome.typed_invoked);
    }

    #[test]
    fn test_resubscribe_replaces_handler() {
        let dispatcher = CommandDispatcher::new();
        let hits = Arc::new(Mutex::new(Vec::new()));
        let first = hits.clone();
        dispatcher.subscribe("Ping", move |_: Delay| first.lock().unwrap().push("first"));
        let second = hits.clone();
        dispatcher.subscribe("PING", move |_: Delay| second.lock().unwrap().push("second"));

        dispatcher.dispatch(&command("ping", "")).unwrap();
        assert_eq!(*hits.lock().unwrap(), vec!["second"]);
        assert_eq!(dispatcher.registered_commands(), vec!["PING".to_string()]);
    }

    #[test]
    fn test_unsubscribe() {
        let dispatcher = CommandDispatcher::new();
        dispatcher.subscribe("Ping", |_: Delay| {});
        assert!(dispatcher.unsubscribe("pingcommand"));
        assert!(!dispatcher.unsubscribe("ping"));

        dispatcher.subscribe_untyped(|_, _| {});
        assert!(dispatcher.unsubscribe_untyped());

        let outcome = dispatcher.dispatch(&command("Ping", "")).unwrap();
        assert_eq!(outcome, DispatchOutcome::default());
    }

    #[test]
    fn test_null_payload_is_default() {
        let dispatcher = CommandDispatcher::new();
        let seen = Arc::new(Mutex::new(None));
        let sink = seen.clone();
        dispatcher.subscribe("Delay", move |args: Delay| *sink.lock().unwrap() = Some(args));

        dispatcher.dispatch(&command("Delay", " null ")).unwrap();
        assert_eq!(*seen.lock().unwrap(), Some(Delay::default()));
    }
}
