//! Lease store backed by a DynamoDB table.
//!
//! Schema: `leaseKey` (S, hash key), `leaseOwner` (S), `leaseCounter` (N),
//! plus any caller-defined attributes, which pass through untouched. An
//! unowned lease stores the sentinel owner `"NULL"`.

use std::collections::HashMap;

use async_trait::async_trait;
use dynomite::Attributes;
use dynomite::dynamodb::{
    AttributeDefinition, AttributeValue, CreateTableError, CreateTableInput, DeleteItemError,
    DeleteItemInput, DynamoDb, DynamoDbClient, KeySchemaElement, ProvisionedThroughput, ScanError,
    ScanInput, UpdateItemError, UpdateItemInput,
};
use rusoto_core::{Region, RusotoError};
use serde_json::{Number, Value};

use super::{DeleteCondition, LeaseRecord, LeaseStore, WriteCondition, WriteImage};
use crate::error::StoreError;

const KEY_ATTR: &str = "leaseKey";
const OWNER_ATTR: &str = "leaseOwner";
const COUNTER_ATTR: &str = "leaseCounter";

/// Stored owner value meaning "no owner".
const NO_OWNER: &str = "NULL";

pub struct DynamoLeaseStore {
    client: DynamoDbClient,
    table: String,
}

impl DynamoLeaseStore {
    pub fn new(region: Region, table: impl Into<String>) -> Self {
        Self {
            client: DynamoDbClient::new(region),
            table: table.into(),
        }
    }

    /// Build on an existing client, e.g. one pointed at a local endpoint.
    pub fn with_client(client: DynamoDbClient, table: impl Into<String>) -> Self {
        Self {
            client,
            table: table.into(),
        }
    }
}

#[async_trait]
impl LeaseStore for DynamoLeaseStore {
    async fn ensure_table(&self, read_cap: u64, write_cap: u64) -> Result<(), StoreError> {
        let input = CreateTableInput {
            table_name: self.table.clone(),
            attribute_definitions: vec![AttributeDefinition {
                attribute_name: KEY_ATTR.to_string(),
                attribute_type: "S".to_string(),
            }],
            key_schema: vec![KeySchemaElement {
                attribute_name: KEY_ATTR.to_string(),
                key_type: "HASH".to_string(),
            }],
            provisioned_throughput: Some(ProvisionedThroughput {
                read_capacity_units: read_cap as i64,
                write_capacity_units: write_cap as i64,
            }),
            ..Default::default()
        };
        match self.client.create_table(input).await {
            Ok(_) => Ok(()),
            Err(RusotoError::Service(CreateTableError::ResourceInUse(_))) => Ok(()),
            Err(RusotoError::Service(CreateTableError::InternalServerError(msg))) => {
                Err(StoreError::Transient(msg))
            }
            Err(err) if transport_is_transient(&err) => Err(StoreError::Transient(err.to_string())),
            Err(err) => Err(StoreError::Rejected(err.to_string())),
        }
    }

    async fn scan(&self) -> Result<Vec<LeaseRecord>, StoreError> {
        let mut records = Vec::new();
        let mut start_key: Option<Attributes> = None;
        loop {
            let input = ScanInput {
                table_name: self.table.clone(),
                consistent_read: Some(true),
                exclusive_start_key: start_key.take(),
                ..Default::default()
            };
            let output = self.client.scan(input).await.map_err(scan_error)?;
            for item in output.items.unwrap_or_default() {
                records.push(decode_record(item)?);
            }
            match output.last_evaluated_key {
                Some(key) if !key.is_empty() => start_key = Some(key),
                _ => break,
            }
        }
        Ok(records)
    }

    async fn ensure_key(&self, key: &str) -> Result<LeaseRecord, StoreError> {
        // An update with no expression creates a bare record when the key is
        // absent and leaves an existing record exactly as it was; a put
        // would clobber the owner and counter of a live lease.
        let input = UpdateItemInput {
            table_name: self.table.clone(),
            key: key_of(key),
            return_values: Some("ALL_NEW".to_string()),
            ..Default::default()
        };
        let output = self.client.update_item(input).await.map_err(update_error)?;
        match output.attributes {
            Some(item) => decode_record(item),
            None => Ok(LeaseRecord {
                key: key.to_string(),
                owner: None,
                counter: 0,
                extras: HashMap::new(),
            }),
        }
    }

    async fn write(
        &self,
        key: &str,
        image: &WriteImage,
        cond: &WriteCondition,
    ) -> Result<(), StoreError> {
        let mut names = HashMap::new();
        names.insert("#owner".to_string(), OWNER_ATTR.to_string());
        names.insert("#counter".to_string(), COUNTER_ATTR.to_string());

        let mut values = HashMap::new();
        values.insert(":owner".to_string(), owner_attr(&image.owner));
        values.insert(":counter".to_string(), number_attr(image.counter));

        let mut sets = vec![
            "#owner = :owner".to_string(),
            "#counter = :counter".to_string(),
        ];
        if let Some(extras) = &image.extras {
            for (index, (name, value)) in extras.iter().enumerate() {
                let name_ref = format!("#x{}", index);
                let value_ref = format!(":x{}", index);
                sets.push(format!("{} = {}", name_ref, value_ref));
                names.insert(name_ref, name.clone());
                values.insert(value_ref, value_to_attr(value));
            }
        }

        let mut predicates = Vec::new();
        if let Some(counter) = cond.counter {
            values.insert(":condCounter".to_string(), number_attr(counter));
            predicates.push("#counter = :condCounter");
        }
        if let Some(owner) = &cond.owner {
            values.insert(":condOwner".to_string(), string_attr(owner));
            predicates.push("#owner = :condOwner");
        }

        let input = UpdateItemInput {
            table_name: self.table.clone(),
            key: key_of(key),
            update_expression: Some(format!("SET {}", sets.join(", "))),
            condition_expression: if predicates.is_empty() {
                None
            } else {
                Some(predicates.join(" AND "))
            },
            expression_attribute_names: Some(names),
            expression_attribute_values: Some(values),
            ..Default::default()
        };
        self.client.update_item(input).await.map_err(update_error)?;
        Ok(())
    }

    async fn remove(&self, key: &str, cond: &DeleteCondition) -> Result<(), StoreError> {
        let mut names = HashMap::new();
        names.insert("#key".to_string(), KEY_ATTR.to_string());
        names.insert("#owner".to_string(), OWNER_ATTR.to_string());
        names.insert("#counter".to_string(), COUNTER_ATTR.to_string());

        let mut values = HashMap::new();
        values.insert(":condOwner".to_string(), owner_attr(&cond.owner));
        values.insert(":condCounter".to_string(), number_attr(cond.counter));

        let input = DeleteItemInput {
            table_name: self.table.clone(),
            key: key_of(key),
            condition_expression: Some(
                "attribute_not_exists(#key) OR (#owner = :condOwner AND #counter = :condCounter)"
                    .to_string(),
            ),
            expression_attribute_names: Some(names),
            expression_attribute_values: Some(values),
            ..Default::default()
        };
        self.client.delete_item(input).await.map_err(delete_error)?;
        Ok(())
    }
}

fn key_of(key: &str) -> Attributes {
    let mut map = Attributes::new();
    map.insert(KEY_ATTR.to_string(), string_attr(key));
    map
}

fn string_attr(value: &str) -> AttributeValue {
    AttributeValue {
        s: Some(value.to_string()),
        ..Default::default()
    }
}

fn number_attr(value: u64) -> AttributeValue {
    AttributeValue {
        n: Some(value.to_string()),
        ..Default::default()
    }
}

fn owner_attr(owner: &Option<String>) -> AttributeValue {
    string_attr(owner.as_deref().unwrap_or(NO_OWNER))
}

fn decode_record(mut item: Attributes) -> Result<LeaseRecord, StoreError> {
    let key = item
        .remove(KEY_ATTR)
        .and_then(|attr| attr.s)
        .ok_or_else(|| {
            StoreError::Corrupt(format!("record is missing the {} attribute", KEY_ATTR))
        })?;
    let owner = match item.remove(OWNER_ATTR).and_then(|attr| attr.s) {
        None => None,
        Some(owner) if owner.is_empty() || owner == NO_OWNER => None,
        Some(owner) => Some(owner),
    };
    let counter = match item.remove(COUNTER_ATTR).and_then(|attr| attr.n) {
        None => 0,
        Some(n) => n.parse::<u64>().map_err(|_| {
            StoreError::Corrupt(format!("lease {}: counter {:?} is not a number", key, n))
        })?,
    };

    let mut extras = HashMap::new();
    for (name, attr) in item {
        if let Some(value) = attr_to_value(&attr) {
            extras.insert(name, value);
        }
    }
    Ok(LeaseRecord {
        key,
        owner,
        counter,
        extras,
    })
}

fn attr_to_value(attr: &AttributeValue) -> Option<Value> {
    if let Some(s) = &attr.s {
        return Some(Value::String(s.clone()));
    }
    if let Some(n) = &attr.n {
        return Some(parse_number(n));
    }
    if let Some(b) = attr.bool {
        return Some(Value::Bool(b));
    }
    if attr.null == Some(true) {
        return Some(Value::Null);
    }
    if let Some(list) = &attr.l {
        return Some(Value::Array(list.iter().filter_map(attr_to_value).collect()));
    }
    if let Some(map) = &attr.m {
        return Some(Value::Object(
            map.iter()
                .filter_map(|(k, v)| attr_to_value(v).map(|v| (k.clone(), v)))
                .collect(),
        ));
    }
    if let Some(ss) = &attr.ss {
        return Some(Value::Array(
            ss.iter().cloned().map(Value::String).collect(),
        ));
    }
    if let Some(ns) = &attr.ns {
        return Some(Value::Array(ns.iter().map(|n| parse_number(n)).collect()));
    }
    // Binary attributes have no JSON counterpart here; they are preserved in
    // the store (writes only set named attributes) but invisible to callers.
    None
}

fn parse_number(n: &str) -> Value {
    if let Ok(i) = n.parse::<i64>() {
        return Value::Number(i.into());
    }
    n.parse::<f64>()
        .ok()
        .and_then(Number::from_f64)
        .map(Value::Number)
        .unwrap_or_else(|| Value::String(n.to_string()))
}

fn value_to_attr(value: &Value) -> AttributeValue {
    match value {
        Value::Null => AttributeValue {
            null: Some(true),
            ..Default::default()
        },
        Value::Bool(b) => AttributeValue {
            bool: Some(*b),
            ..Default::default()
        },
        Value::Number(n) => AttributeValue {
            n: Some(n.to_string()),
            ..Default::default()
        },
        Value::String(s) => string_attr(s),
        Value::Array(items) => AttributeValue {
            l: Some(items.iter().map(value_to_attr).collect()),
            ..Default::default()
        },
        Value::Object(map) => AttributeValue {
            m: Some(
                map.iter()
                    .map(|(k, v)| (k.clone(), value_to_attr(v)))
                    .collect(),
            ),
            ..Default::default()
        },
    }
}

fn transport_is_transient<E>(err: &RusotoError<E>) -> bool {
    match err {
        RusotoError::HttpDispatch(_) => true,
        RusotoError::Unknown(resp) => {
            resp.status.is_server_error() || resp.status.as_u16() == 429
        }
        _ => false,
    }
}

fn scan_error(err: RusotoError<ScanError>) -> StoreError {
    match err {
        RusotoError::Service(ScanError::ProvisionedThroughputExceeded(msg))
        | RusotoError::Service(ScanError::InternalServerError(msg))
        | RusotoError::Service(ScanError::RequestLimitExceeded(msg)) => StoreError::Transient(msg),
        other if transport_is_transient(&other) => StoreError::Transient(other.to_string()),
        other => StoreError::Rejected(other.to_string()),
    }
}

fn update_error(err: RusotoError<UpdateItemError>) -> StoreError {
    match err {
        RusotoError::Service(UpdateItemError::ConditionalCheckFailed(_)) => {
            StoreError::ConditionFailed
        }
        RusotoError::Service(UpdateItemError::ProvisionedThroughputExceeded(msg))
        | RusotoError::Service(UpdateItemError::InternalServerError(msg))
        | RusotoError::Service(UpdateItemError::RequestLimitExceeded(msg))
        | RusotoError::Service(UpdateItemError::TransactionConflict(msg)) => {
            StoreError::Transient(msg)
        }
        other if transport_is_transient(&other) => StoreError::Transient(other.to_string()),
        other => StoreError::Rejected(other.to_string()),
    }
}

fn delete_error(err: RusotoError<DeleteItemError>) -> StoreError {
    match err {
        RusotoError::Service(DeleteItemError::ConditionalCheckFailed(_)) => {
            StoreError::ConditionFailed
        }
        RusotoError::Service(DeleteItemError::ProvisionedThroughputExceeded(msg))
        | RusotoError::Service(DeleteItemError::InternalServerError(msg))
        | RusotoError::Service(DeleteItemError::RequestLimitExceeded(msg))
        | RusotoError::Service(DeleteItemError::TransactionConflict(msg)) => {
            StoreError::Transient(msg)
        }
        other if transport_is_transient(&other) => StoreError::Transient(other.to_string()),
        other => StoreError::Rejected(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn owner_sentinel_normalises_to_none() {
        let mut item = key_of("a");
        item.insert(OWNER_ATTR.to_string(), string_attr(NO_OWNER));
        item.insert(COUNTER_ATTR.to_string(), number_attr(3));
        let record = decode_record(item).unwrap();
        assert_eq!(record.owner, None);
        assert_eq!(record.counter, 3);
    }

    #[test]
    fn bare_record_decodes_as_fresh_lease() {
        let record = decode_record(key_of("a")).unwrap();
        assert_eq!(record.owner, None);
        assert_eq!(record.counter, 0);
        assert!(record.extras.is_empty());
    }

    #[test]
    fn unknown_attributes_round_trip_as_extras() {
        let mut item = key_of("a");
        item.insert("checkpoint".to_string(), string_attr("0042"));
        item.insert("attempts".to_string(), number_attr(7));
        let record = decode_record(item).unwrap();
        assert_eq!(record.extras.get("checkpoint"), Some(&Value::from("0042")));
        assert_eq!(record.extras.get("attempts"), Some(&Value::from(7)));
    }

    #[test]
    fn json_values_survive_attribute_conversion() {
        let value = serde_json::json!({
            "shard": "0001",
            "depth": 12,
            "tags": ["a", "b"],
            "done": false,
        });
        assert_eq!(attr_to_value(&value_to_attr(&value)), Some(value));
    }

    #[test]
    fn record_without_key_is_corrupt() {
        let mut item = HashMap::new();
        item.insert(COUNTER_ATTR.to_string(), number_attr(1));
        assert!(matches!(
            decode_record(item),
            Err(StoreError::Corrupt(_))
        ));
    }
}
