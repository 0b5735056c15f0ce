//! The capability every clustered service exposes

use super::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// An operation invocation addressed to a service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceRequest {
    pub operation: String,
    #[serde(default)]
    pub args: Value,
    /// The operation returns a collection; fan-out concatenates the results
    #[serde(default)]
    pub collect: bool,
}

impl ServiceRequest {
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            args: Value::Null,
            collect: false,
        }
    }

    /// Request for a collection-returning operation
    pub fn collecting(operation: impl Into<String>) -> Self {
        Self {
            collect: true,
            ..Self::new(operation)
        }
    }

    pub fn with_args(mut self, args: Value) -> Self {
        self.args = args;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ServiceResponse {
    Unit,
    Value(Value),
    Collection(Vec<Value>),
}

impl ServiceResponse {
    /// Items contributed to a concatenated fan-out result
    pub fn into_items(self) -> Vec<Value> {
        match self {
            ServiceResponse::Unit => Vec::new(),
            ServiceResponse::Value(value) => vec![value],
            ServiceResponse::Collection(items) => items,
        }
    }
}

/// Implemented by service instances and by the proxies standing in for them
#[async_trait]
pub trait ClusterService: Send + Sync {
    async fn invoke(&self, request: ServiceRequest) -> Result<ServiceResponse>;
}
