use serde::{Deserialize, Serialize, Serializer};

/// A notification exactly as the database driver delivered it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawNotification {
    pub channel: String,
    pub payload: String,
}

impl RawNotification {
    pub fn new(channel: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            payload: payload.into(),
        }
    }
}

/// A quantity change decoded from the notification channel.
///
/// The upstream payload carries no price; consumers that need it look the
/// product up through the store.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductChangeEvent {
    pub ean: String,
    pub name: String,
    pub quantity: i64,
}

/// Price held as integer cents (`numeric(10,2)` in the database).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Deserialize)]
#[serde(transparent)]
pub struct Price(i64);

impl Price {
    pub fn from_cents(cents: i64) -> Self {
        Self(cents)
    }

    pub fn cents(self) -> i64 {
        self.0
    }
}

impl std::fmt::Display for Price {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        write!(f, "{sign}{}.{:02}", abs / 100, abs % 100)
    }
}

/// Serialized as a JSON number with two decimals, e.g. `12.99`.
impl Serialize for Price {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(self.0 as f64 / 100.0)
    }
}

/// A full product row.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Product {
    pub ean: String,
    pub name: String,
    pub quantity: i64,
    pub price: Price,
}

impl Product {
    pub fn new(ean: impl Into<String>, name: impl Into<String>, quantity: i64, price: Price) -> Self {
        Self {
            ean: ean.into(),
            name: name.into(),
            quantity,
            price,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn price_display_two_decimals() {
        assert_eq!(Price::from_cents(1299).to_string(), "12.99");
        assert_eq!(Price::from_cents(5).to_string(), "0.05");
        assert_eq!(Price::from_cents(-250).to_string(), "-2.50");
    }

    #[test]
    fn price_serializes_as_number() {
        let json = serde_json::to_string(&Price::from_cents(1299)).unwrap();
        assert_eq!(json, "12.99");
    }
}
