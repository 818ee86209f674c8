//! Pure routing of `rumqttc` events
//!
//! The driver loop only ever acts on an [`EventRoute`]; everything the broker
//! sends is classified here so the classification can be tested without a
//! network connection.

use rumqttc::{Event, Outgoing, Packet, SubscribeReasonCode};

/// Pure message routing decisions based on MQTT events
pub struct MessageHandler;

impl MessageHandler {
    /// Route MQTT event to appropriate handler (pure routing decision)
    pub fn route_mqtt_event(event: &Event) -> EventRoute {
        match event {
            Event::Incoming(incoming) => match incoming {
                Packet::ConnAck(connack) => EventRoute::ConnectionAcknowledged {
                    session_present: connack.session_present,
                },
                Packet::Publish(publish) => EventRoute::MessageReceived {
                    topic: publish.topic.clone(),
                    payload: publish.payload.to_vec(),
                },
                Packet::SubAck(suback) => EventRoute::SubscriptionAcknowledged {
                    packet_id: suback.pkid,
                    accepted: Self::validate_subscription_success(&suback.return_codes),
                },
                Packet::UnsubAck(unsuback) => EventRoute::UnsubscribeAcknowledged {
                    packet_id: unsuback.pkid,
                },
                Packet::Disconnect => EventRoute::Disconnected,
                other => EventRoute::InfrastructureEvent(format!("{other:?}")),
            },
            Event::Outgoing(outgoing) => match outgoing {
                Outgoing::Subscribe(pkid) => EventRoute::SubscribeSent { packet_id: *pkid },
                Outgoing::Unsubscribe(pkid) => EventRoute::UnsubscribeSent { packet_id: *pkid },
                Outgoing::Disconnect => EventRoute::DisconnectSent,
                _ => EventRoute::OutgoingEvent,
            },
        }
    }

    /// A SUBACK is accepted only if every filter was granted (pure function)
    pub fn validate_subscription_success(return_codes: &[SubscribeReasonCode]) -> bool {
        return_codes
            .iter()
            .all(|code| matches!(code, SubscribeReasonCode::Success(_)))
    }
}

/// Routing decisions for MQTT events
#[derive(Debug, Clone, PartialEq)]
pub enum EventRoute {
    /// Connection acknowledged - ready to publish/subscribe
    ConnectionAcknowledged { session_present: bool },
    /// Message received on subscribed topic
    MessageReceived { topic: String, payload: Vec<u8> },
    /// SUBSCRIBE written to the network with this packet id
    SubscribeSent { packet_id: u16 },
    /// UNSUBSCRIBE written to the network with this packet id
    UnsubscribeSent { packet_id: u16 },
    SubscriptionAcknowledged { packet_id: u16, accepted: bool },
    UnsubscribeAcknowledged { packet_id: u16 },
    /// Our DISCONNECT was flushed
    DisconnectSent,
    /// MQTT broker disconnected
    Disconnected,
    /// Infrastructure event (PingResp, etc.)
    InfrastructureEvent(String),
    /// Outgoing event (handled automatically)
    OutgoingEvent,
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use rumqttc::{ConnAck, ConnectReturnCode, Publish, QoS, SubAck, UnsubAck};

    #[test]
    fn test_route_incoming_events() {
        let connack = Event::Incoming(Packet::ConnAck(ConnAck {
            session_present: true,
            code: ConnectReturnCode::Success,
        }));
        assert_eq!(
            MessageHandler::route_mqtt_event(&connack),
            EventRoute::ConnectionAcknowledged {
                session_present: true
            }
        );

        let mut publish = Publish::new("gateway/0102030405060708/tx", QoS::AtMostOnce, "{}");
        publish.payload = Bytes::from_static(b"{\"token\":1}");
        assert_eq!(
            MessageHandler::route_mqtt_event(&Event::Incoming(Packet::Publish(publish))),
            EventRoute::MessageReceived {
                topic: "gateway/0102030405060708/tx".to_string(),
                payload: b"{\"token\":1}".to_vec(),
            }
        );

        let unsuback = Event::Incoming(Packet::UnsubAck(UnsubAck { pkid: 7 }));
        assert_eq!(
            MessageHandler::route_mqtt_event(&unsuback),
            EventRoute::UnsubscribeAcknowledged { packet_id: 7 }
        );

        assert_eq!(
            MessageHandler::route_mqtt_event(&Event::Incoming(Packet::Disconnect)),
            EventRoute::Disconnected
        );
        assert!(matches!(
            MessageHandler::route_mqtt_event(&Event::Incoming(Packet::PingResp)),
            EventRoute::InfrastructureEvent(_)
        ));
    }

    #[test]
    fn test_route_suback() {
        let granted = Event::Incoming(Packet::SubAck(SubAck::new(
            3,
            vec![SubscribeReasonCode::Success(QoS::AtMostOnce)],
        )));
        assert_eq!(
            MessageHandler::route_mqtt_event(&granted),
            EventRoute::SubscriptionAcknowledged {
                packet_id: 3,
                accepted: true
            }
        );

        let refused = Event::Incoming(Packet::SubAck(SubAck::new(
            4,
            vec![
                SubscribeReasonCode::Success(QoS::AtMostOnce),
                SubscribeReasonCode::Failure,
            ],
        )));
        assert_eq!(
            MessageHandler::route_mqtt_event(&refused),
            EventRoute::SubscriptionAcknowledged {
                packet_id: 4,
                accepted: false
            }
        );
    }

    #[test]
    fn test_route_outgoing_events() {
        assert_eq!(
            MessageHandler::route_mqtt_event(&Event::Outgoing(Outgoing::Subscribe(9))),
            EventRoute::SubscribeSent { packet_id: 9 }
        );
        assert_eq!(
            MessageHandler::route_mqtt_event(&Event::Outgoing(Outgoing::Unsubscribe(10))),
            EventRoute::UnsubscribeSent { packet_id: 10 }
        );
        assert_eq!(
            MessageHandler::route_mqtt_event(&Event::Outgoing(Outgoing::Disconnect)),
            EventRoute::DisconnectSent
        );
        assert_eq!(
            MessageHandler::route_mqtt_event(&Event::Outgoing(Outgoing::PingReq)),
            EventRoute::OutgoingEvent
        );
    }

    #[test]
    fn test_validate_subscription_success() {
        assert!(MessageHandler::validate_subscription_success(&[
            SubscribeReasonCode::Success(QoS::AtMostOnce),
            SubscribeReasonCode::Success(QoS::AtLeastOnce),
        ]));
        assert!(!MessageHandler::validate_subscription_success(&[
            SubscribeReasonCode::Failure
        ]));
        // An empty SUBACK grants nothing but refuses nothing either
        assert!(MessageHandler::validate_subscription_success(&[]));
    }
}
