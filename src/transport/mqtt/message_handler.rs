//! Pure routing of rumqttc events
//!
//! Nothing here touches the network; the client feeds each polled event through
//! [`MessageHandler::route_mqtt_event`] and acts on the returned [`EventRoute`].

use crate::transport::InboundMessage;
use rumqttc::v5::mqttbytes::v5::{Packet, Publish, SubscribeReasonCode};
use rumqttc::v5::Event;

/// Routing decisions for MQTT events
#[derive(Debug, Clone, PartialEq)]
pub enum EventRoute {
    /// Broker accepted the connection
    ConnectionAcknowledged,
    /// Publish on one of our subscriptions
    MessageReceived(InboundMessage),
    /// Broker closed the session
    Disconnected,
    /// Subscription outcome for the most recent SUBSCRIBE
    SubscriptionConfirmed { packet_id: u16, granted: bool },
    /// PingResp, PubAck and friends
    InfrastructureEvent(String),
    OutgoingEvent,
}

pub struct MessageHandler;

impl MessageHandler {
    pub fn route_mqtt_event(event: &Event) -> EventRoute {
        match event {
            Event::Incoming(incoming) => match incoming {
                Packet::ConnAck(_) => EventRoute::ConnectionAcknowledged,
                Packet::Publish(publish) => {
                    EventRoute::MessageReceived(Self::inbound_from_publish(publish))
                }
                Packet::Disconnect(_) => EventRoute::Disconnected,
                Packet::SubAck(suback) => EventRoute::SubscriptionConfirmed {
                    packet_id: suback.pkid,
                    granted: Self::subscription_granted(&suback.return_codes),
                },
                other => EventRoute::InfrastructureEvent(format!("{other:?}")),
            },
            Event::Outgoing(_) => EventRoute::OutgoingEvent,
        }
    }

    pub fn inbound_from_publish(publish: &Publish) -> InboundMessage {
        let user_properties = publish
            .properties
            .as_ref()
            .map(|props| props.user_properties.clone())
            .unwrap_or_default();

        InboundMessage {
            topic: String::from_utf8_lossy(&publish.topic).to_string(),
            payload: publish.payload.to_vec(),
            user_properties,
            retain: publish.retain,
        }
    }

    /// Every filter in the SUBSCRIBE must have been granted
    pub fn subscription_granted(return_codes: &[SubscribeReasonCode]) -> bool {
        !return_codes.is_empty()
            && return_codes
                .iter()
                .all(|code| matches!(code, SubscribeReasonCode::Success(_)))
    }
}
