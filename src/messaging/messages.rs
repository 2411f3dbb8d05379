//! Broker Messages
//!
//! Product events published by the catalog. Payloads are JSON and field
//! names are matched case-insensitively, ignoring `_` and `-`.

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::config::BrokerConfig;
use crate::error::DecodeError;
use crate::models::ProductInfo;

/// A message type bound to one queue and one routing key.
pub trait BrokerMessage: DeserializeOwned + std::fmt::Debug + Send + 'static {
    /// Short name used in logs and consumer tags.
    const KIND: &'static str;

    const QUEUE: &'static str;

    fn exchange(config: &BrokerConfig) -> &str {
        &config.products_exchange
    }

    fn routing_key(config: &BrokerConfig) -> &str;

    fn decode(body: &[u8]) -> Result<Self, DecodeError> {
        decode_case_insensitive(body)
    }
}

/// Parses `body` as JSON and deserializes it after folding every object key
/// to lowercase with `_` and `-` removed.
pub fn decode_case_insensitive<T: DeserializeOwned>(body: &[u8]) -> Result<T, DecodeError> {
    let value: Value =
        serde_json::from_slice(body).map_err(|e| DecodeError::Malformed(e.to_string()))?;
    if value.is_null() {
        return Err(DecodeError::Null);
    }
    serde_json::from_value(fold_keys(value)).map_err(|e| DecodeError::Malformed(e.to_string()))
}

fn fold_keys(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(key, value)| (fold_key(&key), fold_keys(value)))
                .collect::<Map<String, Value>>(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(fold_keys).collect()),
        other => other,
    }
}

fn fold_key(key: &str) -> String {
    key.chars()
        .filter(|c| *c != '_' && *c != '-')
        .flat_map(char::to_lowercase)
        .collect()
}

// == Product Updated ==
/// Full snapshot of a product after a change.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ProductUpdated {
    #[serde(alias = "productid")]
    pub id: Uuid,
    pub name: String,
    pub category: String,
    #[serde(rename = "unitprice")]
    pub unit_price: f64,
    #[serde(rename = "quantityinstock")]
    pub quantity_in_stock: i32,
}

impl BrokerMessage for ProductUpdated {
    const KIND: &'static str = "product-updated";
    const QUEUE: &'static str = "orders.product.updated.queue";

    fn routing_key(config: &BrokerConfig) -> &str {
        &config.product_updated_routing_key
    }
}

impl From<ProductUpdated> for ProductInfo {
    fn from(message: ProductUpdated) -> Self {
        ProductInfo {
            id: message.id,
            name: message.name,
            category: message.category,
            unit_price: message.unit_price,
            quantity_in_stock: message.quantity_in_stock,
        }
    }
}

// == Product Deleted ==
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ProductDeleted {
    #[serde(rename = "productid", alias = "id")]
    pub product_id: Uuid,
}

impl BrokerMessage for ProductDeleted {
    const KIND: &'static str = "product-deleted";
    const QUEUE: &'static str = "orders.product.deleted.queue";

    fn routing_key(config: &BrokerConfig) -> &str {
        &config.product_deleted_routing_key
    }
}

// == Product Name Updated ==
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ProductNameUpdated {
    #[serde(rename = "productid", alias = "id")]
    pub product_id: Uuid,
    #[serde(rename = "newname")]
    pub new_name: String,
}

impl BrokerMessage for ProductNameUpdated {
    const KIND: &'static str = "product-name-updated";
    const QUEUE: &'static str = "orders.product.name.updated.queue";

    fn routing_key(config: &BrokerConfig) -> &str {
        &config.product_name_updated_routing_key
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const ID: &str = "6f1c1d9e-5b0a-4e8e-9d55-0a3c5a5f9b10";

    fn body(value: Value) -> Vec<u8> {
        serde_json::to_vec(&value).unwrap()
    }

    #[test]
    fn test_decode_pascal_case() {
        let message = ProductUpdated::decode(&body(json!({
            "Id": ID,
            "Name": "Desk",
            "Category": "Furniture",
            "UnitPrice": 120.5,
            "QuantityInStock": 3
        })))
        .unwrap();

        assert_eq!(message.name, "Desk");
        assert_eq!(message.unit_price, 120.5);
        assert_eq!(message.quantity_in_stock, 3);
    }

    #[test]
    fn test_decode_snake_and_camel_case() {
        let deleted = ProductDeleted::decode(&body(json!({ "product_id": ID }))).unwrap();
        assert_eq!(deleted.product_id.to_string(), ID);

        let renamed =
            ProductNameUpdated::decode(&body(json!({ "productId": ID, "newName": "Chair" })))
                .unwrap();
        assert_eq!(renamed.new_name, "Chair");
    }

    #[test]
    fn test_decode_null_payload() {
        assert_eq!(ProductDeleted::decode(b"null"), Err(DecodeError::Null));
    }

    #[test]
    fn test_decode_malformed_payload() {
        assert!(matches!(
            ProductDeleted::decode(b"{not json"),
            Err(DecodeError::Malformed(_))
        ));
        assert!(matches!(
            ProductDeleted::decode(&body(json!({ "productId": "not-a-uuid" }))),
            Err(DecodeError::Malformed(_))
        ));
        assert!(matches!(
            ProductNameUpdated::decode(&body(json!({ "productId": ID }))),
            Err(DecodeError::Malformed(_))
        ));
    }

    #[test]
    fn test_fold_key() {
        assert_eq!(fold_key("Quantity_In-Stock"), "quantityinstock");
    }

    #[test]
    fn test_routing_keys_come_from_config() {
        let config = BrokerConfig::default();
        assert_eq!(ProductDeleted::routing_key(&config), "product.deleted");
        assert_eq!(ProductUpdated::exchange(&config), "products.exchange");
        assert_eq!(ProductNameUpdated::QUEUE, "orders.product.name.updated.queue");
    }
}
