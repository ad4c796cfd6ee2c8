//! Wire envelopes exchanged with clients.

use serde::Deserialize;
use serde_json::{json, Value};

use crate::{error::ProtocolError, event::Event, filter::Filter};

/// A decoded client frame.
#[derive(Debug)]
pub enum ClientMessage {
    Event(Box<Event>),
    Req { sub_id: String, filters: Vec<Filter> },
    Count { sub_id: String, filters: Vec<Filter> },
    Close(String),
    Auth(Box<Event>),
}

impl ClientMessage {
    /// Decode a text frame. The label decides the shape of the rest.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let val: Value = serde_json::from_str(text).map_err(|_| ProtocolError::NotAnArray)?;
        let arr = val.as_array().ok_or(ProtocolError::NotAnArray)?;
        let label = arr
            .first()
            .and_then(Value::as_str)
            .ok_or(ProtocolError::NotAnArray)?;
        match label {
            "EVENT" => Ok(ClientMessage::Event(Box::new(event_at(arr, "EVENT")?))),
            "AUTH" => Ok(ClientMessage::Auth(Box::new(event_at(arr, "AUTH")?))),
            "REQ" => {
                let (sub_id, filters) = subscription(arr, "REQ")?;
                Ok(ClientMessage::Req { sub_id, filters })
            }
            "COUNT" => {
                let (sub_id, filters) = subscription(arr, "COUNT")?;
                Ok(ClientMessage::Count { sub_id, filters })
            }
            "CLOSE" => Ok(ClientMessage::Close(sub_id_at(arr, "CLOSE")?)),
            other => Err(ProtocolError::UnknownLabel(other.to_string())),
        }
    }
}

fn malformed(label: &'static str, reason: impl Into<String>) -> ProtocolError {
    ProtocolError::Malformed {
        label,
        reason: reason.into(),
    }
}

fn event_at(arr: &[Value], label: &'static str) -> Result<Event, ProtocolError> {
    let raw = arr.get(1).ok_or_else(|| malformed(label, "missing event"))?;
    Event::deserialize(raw).map_err(|e| malformed(label, e.to_string()))
}

fn sub_id_at(arr: &[Value], label: &'static str) -> Result<String, ProtocolError> {
    arr.get(1)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .ok_or_else(|| malformed(label, "missing subscription id"))
}

fn subscription(
    arr: &[Value],
    label: &'static str,
) -> Result<(String, Vec<Filter>), ProtocolError> {
    let sub_id = sub_id_at(arr, label)?;
    let mut filters = Vec::with_capacity(arr.len().saturating_sub(2));
    for raw in &arr[2..] {
        match Filter::from_value(raw) {
            Ok(f) => filters.push(f),
            Err(reason) => return Err(ProtocolError::BadFilter { sub_id, reason }),
        }
    }
    Ok((sub_id, filters))
}

/// A frame sent to a client.
#[derive(Debug)]
pub enum RelayMessage<'a> {
    Event { sub_id: &'a str, event: &'a Event },
    Ok { id: &'a str, accepted: bool, reason: &'a str },
    Eose(&'a str),
    Closed { sub_id: &'a str, reason: &'a str },
    Notice(&'a str),
    Count { sub_id: &'a str, count: i64 },
    Auth(&'a str),
}

impl RelayMessage<'_> {
    pub fn to_json(&self) -> String {
        let val = match self {
            RelayMessage::Event { sub_id, event } => json!(["EVENT", sub_id, event]),
            RelayMessage::Ok {
                id,
                accepted,
                reason,
            } => json!(["OK", id, accepted, reason]),
            RelayMessage::Eose(sub_id) => json!(["EOSE", sub_id]),
            RelayMessage::Closed { sub_id, reason } => json!(["CLOSED", sub_id, reason]),
            RelayMessage::Notice(msg) => json!(["NOTICE", msg]),
            RelayMessage::Count { sub_id, count } => json!(["COUNT", sub_id, {"count": count}]),
            RelayMessage::Auth(challenge) => json!(["AUTH", challenge]),
        };
        val.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::fixtures::signed;

    #[test]
    fn parses_event_and_auth() {
        let ev = signed(1, 1, 10, &[], "hi");
        let frame = json!(["EVENT", ev]).to_string();
        match ClientMessage::parse(&frame).unwrap() {
            ClientMessage::Event(got) => assert_eq!(*got, ev),
            other => panic!("unexpected {other:?}"),
        }
        let frame = json!(["AUTH", ev]).to_string();
        assert!(matches!(ClientMessage::parse(&frame).unwrap(), ClientMessage::Auth(_)));
    }

    #[test]
    fn parses_req_with_filters() {
        let frame = json!(["REQ", "sub", {"kinds": [1]}, {"#t": ["x"]}]).to_string();
        match ClientMessage::parse(&frame).unwrap() {
            ClientMessage::Req { sub_id, filters } => {
                assert_eq!(sub_id, "sub");
                assert_eq!(filters.len(), 2);
                assert_eq!(filters[0].kinds, Some(vec![1]));
                assert_eq!(filters[1].tags["t"], vec!["x".to_string()]);
            }
            other => panic!("unexpected {other:?}"),
        }
        let frame = json!(["COUNT", "c", {}]).to_string();
        assert!(matches!(
            ClientMessage::parse(&frame).unwrap(),
            ClientMessage::Count { .. }
        ));
    }

    #[test]
    fn bad_filter_keeps_sub_id() {
        let frame = json!(["REQ", "sub", {"kinds": ["one"]}]).to_string();
        match ClientMessage::parse(&frame).unwrap_err() {
            ProtocolError::BadFilter { sub_id, .. } => assert_eq!(sub_id, "sub"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn rejects_garbage() {
        assert!(matches!(
            ClientMessage::parse("not json").unwrap_err(),
            ProtocolError::NotAnArray
        ));
        assert!(matches!(
            ClientMessage::parse("{}").unwrap_err(),
            ProtocolError::NotAnArray
        ));
        assert!(matches!(
            ClientMessage::parse(r#"["PING"]"#).unwrap_err(),
            ProtocolError::UnknownLabel(l) if l == "PING"
        ));
        assert!(matches!(
            ClientMessage::parse(r#"["CLOSE"]"#).unwrap_err(),
            ProtocolError::Malformed { label: "CLOSE", .. }
        ));
        assert!(matches!(
            ClientMessage::parse(r#"["EVENT", {"id": 1}]"#).unwrap_err(),
            ProtocolError::Malformed { label: "EVENT", .. }
        ));
    }

    #[test]
    fn renders_relay_frames() {
        assert_eq!(
            RelayMessage::Ok {
                id: "ab",
                accepted: false,
                reason: "invalid: bad"
            }
            .to_json(),
            r#"["OK","ab",false,"invalid: bad"]"#
        );
        assert_eq!(RelayMessage::Eose("s").to_json(), r#"["EOSE","s"]"#);
        assert_eq!(
            RelayMessage::Count { sub_id: "c", count: 3 }.to_json(),
            r#"["COUNT","c",{"count":3}]"#
        );
        assert_eq!(RelayMessage::Auth("xyz").to_json(), r#"["AUTH","xyz"]"#);
        let ev = signed(1, 1, 10, &[], "hi");
        let frame: Value = serde_json::from_str(
            &RelayMessage::Event {
                sub_id: "s",
                event: &ev,
            }
            .to_json(),
        )
        .unwrap();
        assert_eq!(frame[0], "EVENT");
        assert_eq!(frame[2]["id"], json!(ev.id));
    }
}
