//! The RESP value model and its wire encoder, per spec §4.8: simple
//! string, error, integer, bulk string (with a null variant), array (with
//! a null variant), plus a RESP3 null terminator recognized for forward
//! compatibility.

/// A fully decoded RESP value.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    SimpleString(String),
    Error(String),
    Integer(i64),
    /// `$-1\r\n` decodes to `BulkString(None)`.
    BulkString(Option<Vec<u8>>),
    /// `*-1\r\n` decodes to `Array(None)`.
    Array(Option<Vec<Value>>),
    /// RESP3's `_\r\n` null terminator, recognized for forward
    /// compatibility though this crate otherwise speaks RESP2.
    Null,
}

impl Value {
    pub fn bulk(data: impl Into<Vec<u8>>) -> Value {
        Value::BulkString(Some(data.into()))
    }

    pub fn array(items: Vec<Value>) -> Value {
        Value::Array(Some(items))
    }

    /// Builds a command array of bulk strings — the shape every Redis
    /// command is sent as, per spec §4.8's pipelining example.
    pub fn command(parts: &[&str]) -> Value {
        Value::Array(Some(parts.iter().map(|p| Value::bulk(p.as_bytes().to_vec())).collect()))
    }
}

/// Serializes `value` to its RESP wire form.
pub fn encode(value: &Value) -> Vec<u8> {
    let mut out = Vec::new();
    encode_into(value, &mut out);
    out
}

fn encode_into(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::SimpleString(s) => {
            out.push(b'+');
            out.extend_from_slice(s.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        Value::Error(s) => {
            out.push(b'-');
            out.extend_from_slice(s.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        Value::Integer(n) => {
            out.push(b':');
            out.extend_from_slice(n.to_string().as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        Value::BulkString(None) => out.extend_from_slice(b"$-1\r\n"),
        Value::BulkString(Some(data)) => {
            out.push(b'$');
            out.extend_from_slice(data.len().to_string().as_bytes());
            out.extend_from_slice(b"\r\n");
            out.extend_from_slice(data);
            out.extend_from_slice(b"\r\n");
        }
        Value::Array(None) => out.extend_from_slice(b"*-1\r\n"),
        Value::Array(Some(items)) => {
            out.push(b'*');
            out.extend_from_slice(items.len().to_string().as_bytes());
            out.extend_from_slice(b"\r\n");
            for item in items {
                encode_into(item, out);
            }
        }
        Value::Null => out.extend_from_slice(b"_\r\n"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resp::parser::Parser;

    fn round_trip(value: Value) {
        let wire = encode(&value);
        let mut parser = Parser::new();
        let (consumed, decoded) = parser.feed(&wire).unwrap();
        assert_eq!(consumed, wire.len());
        assert_eq!(decoded.unwrap(), value);
    }

    #[test]
    fn simple_types_round_trip() {
        round_trip(Value::SimpleString("OK".to_string()));
        round_trip(Value::Error("ERR bad".to_string()));
        round_trip(Value::Integer(-42));
        round_trip(Value::bulk(b"hello".to_vec()));
        round_trip(Value::BulkString(None));
        round_trip(Value::Null);
    }

    #[test]
    fn nested_array_round_trips() {
        let value = Value::array(vec![
            Value::bulk(b"PING".to_vec()),
            Value::array(vec![Value::Integer(1), Value::BulkString(None)]),
            Value::Array(None),
        ]);
        round_trip(value);
    }

    #[test]
    fn command_builds_an_array_of_bulk_strings() {
        let value = Value::command(&["SET", "k", "v"]);
        match value {
            Value::Array(Some(items)) => assert_eq!(items.len(), 3),
            _ => panic!("expected an array"),
        }
    }
}
