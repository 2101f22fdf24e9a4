//! Payload decoding for the product notification channel.
//!
//! The database trigger sends `{"ean": "...", "nom": "...", "quantite": n}`.
//! English field names (`name`, `quantity`) are accepted as aliases. Any
//! other field, `prix` included, is ignored.

use serde_json::{Map, Value};
use stock_core::{ProductChangeEvent, RawNotification};

use crate::error::DecodeError;

const EAN: &str = "ean";
const NAME: [&str; 2] = ["nom", "name"];
const QUANTITY: [&str; 2] = ["quantite", "quantity"];

/// Decode one raw notification into a product change.
pub fn decode(raw: &RawNotification) -> Result<ProductChangeEvent, DecodeError> {
    decode_payload(&raw.payload)
}

/// Decode a payload string.
pub fn decode_payload(payload: &str) -> Result<ProductChangeEvent, DecodeError> {
    let value: Value =
        serde_json::from_str(payload).map_err(|e| DecodeError::Malformed(e.to_string()))?;
    let object = value.as_object().ok_or(DecodeError::NotAnObject)?;

    let ean = field(object, &[EAN], EAN)?
        .as_str()
        .ok_or(DecodeError::InvalidField { field: EAN, expected: "a string" })?;
    if ean.trim().is_empty() {
        return Err(DecodeError::EmptyEan);
    }

    let name = field(object, &NAME, NAME[0])?
        .as_str()
        .ok_or(DecodeError::InvalidField { field: NAME[0], expected: "a string" })?;

    let quantity = field(object, &QUANTITY, QUANTITY[0])?
        .as_i64()
        .ok_or(DecodeError::InvalidField { field: QUANTITY[0], expected: "an integer" })?;

    Ok(ProductChangeEvent {
        ean: ean.to_string(),
        name: name.to_string(),
        quantity,
    })
}

/// First non-null value among `keys`.
fn field<'a>(
    object: &'a Map<String, Value>,
    keys: &[&str],
    reported: &'static str,
) -> Result<&'a Value, DecodeError> {
    keys.iter()
        .filter_map(|key| object.get(*key))
        .find(|value| !value.is_null())
        .ok_or(DecodeError::MissingField(reported))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(payload: &str) -> RawNotification {
        RawNotification::new("product_quantity_updated", payload)
    }

    #[test]
    fn decodes_trigger_payload() {
        let event = decode(&raw(r#"{"ean":"123","nom":"Widget","quantite":5}"#)).unwrap();
        assert_eq!(
            event,
            ProductChangeEvent {
                ean: "123".into(),
                name: "Widget".into(),
                quantity: 5,
            }
        );
    }

    #[test]
    fn price_is_ignored() {
        let with_price = decode(&raw(r#"{"ean":"1","nom":"A","quantite":3,"prix":9.99}"#)).unwrap();
        let without = decode(&raw(r#"{"ean":"1","nom":"A","quantite":3}"#)).unwrap();
        assert_eq!(with_price, without);
    }

    #[test]
    fn negative_quantity_allowed() {
        let event = decode(&raw(r#"{"ean":"1","nom":"A","quantite":-42}"#)).unwrap();
        assert_eq!(event.quantity, -42);
    }

    #[test]
    fn english_aliases_accepted() {
        let event = decode(&raw(r#"{"ean":"9","name":"Gadget","quantity":1}"#)).unwrap();
        assert_eq!(event.name, "Gadget");
        assert_eq!(event.quantity, 1);
    }

    #[test]
    fn missing_ean_fails() {
        let err = decode(&raw(r#"{"nom":"Widget","quantite":5}"#)).unwrap_err();
        assert_eq!(err, DecodeError::MissingField("ean"));
    }

    #[test]
    fn null_ean_counts_as_missing() {
        let err = decode(&raw(r#"{"ean":null,"nom":"Widget","quantite":5}"#)).unwrap_err();
        assert_eq!(err, DecodeError::MissingField("ean"));
    }

    #[test]
    fn missing_name_and_quantity_fail() {
        assert_eq!(
            decode(&raw(r#"{"ean":"1","quantite":5}"#)).unwrap_err(),
            DecodeError::MissingField("nom")
        );
        assert_eq!(
            decode(&raw(r#"{"ean":"1","nom":"A"}"#)).unwrap_err(),
            DecodeError::MissingField("quantite")
        );
    }

    #[test]
    fn blank_ean_fails() {
        let err = decode(&raw(r#"{"ean":"  ","nom":"A","quantite":1}"#)).unwrap_err();
        assert_eq!(err, DecodeError::EmptyEan);
    }

    #[test]
    fn wrong_types_fail() {
        assert!(matches!(
            decode(&raw(r#"{"ean":123,"nom":"A","quantite":1}"#)),
            Err(DecodeError::InvalidField { field: "ean", .. })
        ));
        assert!(matches!(
            decode(&raw(r#"{"ean":"1","nom":"A","quantite":"five"}"#)),
            Err(DecodeError::InvalidField { field: "quantite", .. })
        ));
        assert!(matches!(
            decode(&raw(r#"{"ean":"1","nom":"A","quantite":1.5}"#)),
            Err(DecodeError::InvalidField { field: "quantite", .. })
        ));
    }

    #[test]
    fn malformed_and_non_object_fail() {
        assert!(matches!(decode(&raw("not json")), Err(DecodeError::Malformed(_))));
        assert_eq!(decode(&raw("[1,2]")).unwrap_err(), DecodeError::NotAnObject);
    }
}
