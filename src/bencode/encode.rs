use super::value::{Dictionary, Value};

/// Encode a value into bencode. Dictionaries are written in their insertion order.
pub fn encode(value: &Value) -> Vec<u8> {
    let mut buffer = Vec::new();
    encode_value(value, &mut buffer);
    buffer
}

impl Value {
    pub fn encode(&self) -> Vec<u8> {
        encode(self)
    }
}

impl Dictionary {
    pub fn encode(&self) -> Vec<u8> {
        let mut buffer = Vec::new();
        encode_dict(self, &mut buffer);
        buffer
    }
}

fn encode_value(value: &Value, buffer: &mut Vec<u8>) {
    match value {
        Value::Integer(i) => {
            buffer.push(b'i');
            buffer.extend_from_slice(i.to_string().as_bytes());
            buffer.push(b'e');
        }
        Value::Bytes(bytes) => encode_bytes(bytes, buffer),
        Value::List(list) => {
            buffer.push(b'l');
            for item in list {
                encode_value(item, buffer);
            }
            buffer.push(b'e');
        }
        Value::Dict(dict) => encode_dict(dict, buffer),
    }
}

fn encode_bytes(bytes: &[u8], buffer: &mut Vec<u8>) {
    buffer.extend_from_slice(bytes.len().to_string().as_bytes());
    buffer.push(b':');
    buffer.extend_from_slice(bytes);
}

fn encode_dict(dict: &Dictionary, buffer: &mut Vec<u8>) {
    buffer.push(b'd');
    for (key, value) in dict.iter() {
        encode_bytes(key, buffer);
        encode_value(value, buffer);
    }
    buffer.push(b'e');
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_primitives() {
        assert_eq!(encode(&Value::Integer(42)), b"i42e");
        assert_eq!(encode(&Value::Integer(-7)), b"i-7e");
        assert_eq!(encode(&Value::Integer(0)), b"i0e");
        assert_eq!(encode(&Value::from("spam")), b"4:spam");
        assert_eq!(encode(&Value::from("")), b"0:");
        assert_eq!(
            encode(&Value::List(vec![Value::from("a"), Value::Integer(1)])),
            b"l1:ai1ee"
        );
    }

    #[test]
    fn encode_dictionary_in_insertion_order() {
        let dict = Dictionary::builder()
            .insert("t", "aa")
            .insert("y", "q")
            .insert("q", "ping")
            .build();

        assert_eq!(dict.encode(), b"d1:t2:aa1:y1:q1:q4:pinge");
    }

    #[test]
    fn builder_replaces_existing_key() {
        let dict = Dictionary::builder()
            .insert("a", 1i64)
            .insert("b", 2i64)
            .insert("a", 3i64)
            .insert_opt::<_, i64>("c", None)
            .build();

        assert_eq!(dict.encode(), b"d1:ai3e1:bi2ee");
    }
}
