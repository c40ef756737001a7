// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Carrier traits for pathway context propagation.
//!
//! Carriers abstract over the transport that travels with a message: HTTP headers, message
//! queue metadata, JSON envelopes. Text carriers only hold strings; binary-capable carriers
//! (for example Kafka record headers) also hold raw bytes, which lets the pathway context skip
//! the base64 step.
//!
//! Keys are normalized to lowercase so HTTP header casing does not matter.

use std::collections::HashMap;

use serde_json::Value;

pub trait Injector {
    /// Sets a text value. Keys are lowercased.
    fn set(&mut self, key: &str, value: String);

    /// Sets a binary value, returning `false` when the carrier only holds text.
    fn set_binary(&mut self, _key: &str, _value: Vec<u8>) -> bool {
        false
    }
}

pub trait Extractor {
    /// Gets a text value by key, case-insensitively.
    fn get(&self, key: &str) -> Option<&str>;

    /// Gets a binary value by key. Text-only carriers have none.
    fn get_binary(&self, _key: &str) -> Option<&[u8]> {
        None
    }

    fn keys(&self) -> Vec<&str>;
}

impl<S: std::hash::BuildHasher> Injector for HashMap<String, String, S> {
    fn set(&mut self, key: &str, value: String) {
        self.insert(key.to_lowercase(), value);
    }
}

impl<S: std::hash::BuildHasher> Extractor for HashMap<String, String, S> {
    fn get(&self, key: &str) -> Option<&str> {
        self.get(&key.to_lowercase()).map(String::as_str)
    }

    fn keys(&self) -> Vec<&str> {
        self.keys().map(String::as_str).collect::<Vec<_>>()
    }
}

/// Byte-valued headers, as found on most message brokers.
impl<S: std::hash::BuildHasher> Injector for HashMap<String, Vec<u8>, S> {
    fn set(&mut self, key: &str, value: String) {
        self.insert(key.to_lowercase(), value.into_bytes());
    }

    fn set_binary(&mut self, key: &str, value: Vec<u8>) -> bool {
        self.insert(key.to_lowercase(), value);
        true
    }
}

impl<S: std::hash::BuildHasher> Extractor for HashMap<String, Vec<u8>, S> {
    fn get(&self, key: &str) -> Option<&str> {
        self.get(&key.to_lowercase())
            .and_then(|value| std::str::from_utf8(value).ok())
    }

    fn get_binary(&self, key: &str) -> Option<&[u8]> {
        self.get(&key.to_lowercase()).map(Vec::as_slice)
    }

    fn keys(&self) -> Vec<&str> {
        self.keys().map(String::as_str).collect::<Vec<_>>()
    }
}

/// Only `Value::Object` carries anything; other values are ignored.
impl Injector for Value {
    fn set(&mut self, key: &str, value: String) {
        if let Value::Object(map) = self {
            map.insert(key.to_lowercase(), Value::String(value));
        }
    }
}

impl Extractor for Value {
    fn get(&self, key: &str) -> Option<&str> {
        if let Value::Object(map) = self {
            map.get(&key.to_lowercase()).and_then(|v| v.as_str())
        } else {
            None
        }
    }

    fn keys(&self) -> Vec<&str> {
        if let Value::Object(map) = self {
            map.keys().map(String::as_str).collect::<Vec<_>>()
        } else {
            Vec::new()
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn hash_map_get() {
        let mut carrier: HashMap<String, String> = HashMap::new();
        carrier.set("Dd-Pathway-Ctx-Base64", "value".to_string());

        assert_eq!(
            Extractor::get(&carrier, "DD-PATHWAY-CTX-BASE64"),
            Some("value"),
            "case insensitive extraction"
        );
        assert_eq!(Extractor::get_binary(&carrier, "dd-pathway-ctx-base64"), None);
    }

    #[test]
    fn text_carrier_rejects_binary() {
        let mut carrier: HashMap<String, String> = HashMap::new();
        assert!(!carrier.set_binary("dd-pathway-ctx", vec![1, 2, 3]));
        assert!(carrier.is_empty());
    }

    #[test]
    fn binary_hash_map_round_trip() {
        let mut carrier: HashMap<String, Vec<u8>> = HashMap::new();
        assert!(carrier.set_binary("DD-Pathway-Ctx", vec![0xff, 0x00, 0x7f]));
        carrier.set("topic", "orders".to_string());

        assert_eq!(
            Extractor::get_binary(&carrier, "dd-pathway-ctx"),
            Some(&[0xff, 0x00, 0x7f][..])
        );
        assert_eq!(Extractor::get(&carrier, "TOPIC"), Some("orders"));
        // not valid utf-8
        assert_eq!(Extractor::get(&carrier, "dd-pathway-ctx"), None);

        let keys = Extractor::keys(&carrier);
        assert_eq!(keys.len(), 2);
        assert!(keys.contains(&"dd-pathway-ctx"));
    }

    #[test]
    fn serde_value_get_and_keys() {
        let mut carrier = Value::Object(serde_json::Map::new());
        carrier.set("headerName1", "value1".to_string());
        carrier.set("headerName2", "value2".to_string());

        assert_eq!(Extractor::get(&carrier, "HEADERNAME1"), Some("value1"));
        let got = Extractor::keys(&carrier);
        assert_eq!(got.len(), 2);
        assert!(got.contains(&"headername2"));
    }

    #[test]
    fn serde_non_object_is_ignored() {
        let mut carrier = Value::Null;
        carrier.set("key", "value".to_string());
        assert_eq!(Extractor::get(&carrier, "key"), None);
        assert!(Extractor::keys(&carrier).is_empty());
    }
}
