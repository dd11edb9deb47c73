use serde::{Deserialize, Serialize};

/// Transactions of this kind are replies that must reach the pipeline even
/// when the shard holding them is dissolved.
pub const RESPONSE_KIND: &str = "response";

/// Transactions of this kind place their contract in the shard table once
/// committed. They never reach the pipeline.
pub const ASSIGN_CONTRACT_KIND: &str = "assign-contract";

/// Unit of work submitted by callers. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub kind: String,
    pub payload: Vec<u8>,

    /// Contract the transaction is addressed to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contract: Option<String>,
}

impl Transaction {
    pub fn new(kind: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            kind: kind.into(),
            payload: payload.into(),
            contract: None,
        }
    }

    pub fn for_contract(contract: impl Into<String>, kind: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            contract: Some(contract.into()),
            ..Self::new(kind, payload)
        }
    }

    /// Request to place `contract` in the shard table.
    pub fn assign_contract(contract: impl Into<String>) -> Self {
        Self::for_contract(contract, ASSIGN_CONTRACT_KIND, Vec::new())
    }

    pub fn is_response(&self) -> bool {
        self.kind == RESPONSE_KIND
    }

    pub fn is_contract_assignment(&self) -> bool {
        self.kind == ASSIGN_CONTRACT_KIND && self.contract.is_some()
    }
}
