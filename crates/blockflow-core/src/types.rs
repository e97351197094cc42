use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{BlockflowError, Result};
use crate::traits::Signer;

/// String-keyed, string-valued block inputs.
pub type Inputs = BTreeMap<String, String>;

/// String-keyed, string-valued block outputs.
pub type Outputs = BTreeMap<String, String>;

/// Unique identifier of one execution run.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct RunId(pub String);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Block category. Triggers start runs and never receive execution edges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockCategory {
    Trigger,
    Action,
    Filter,
    Display,
}

impl BlockCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trigger => "trigger",
            Self::Action => "action",
            Self::Filter => "filter",
            Self::Display => "display",
        }
    }
}

impl std::fmt::Display for BlockCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How an input field is edited and whether it may be wired.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputKind {
    #[default]
    Text,
    Number,
    Select {
        options: Vec<String>,
    },
    /// Always sourced from the active signer; never accepts connections.
    WalletAddress,
}

/// A declared block input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputField {
    pub name: String,
    #[serde(default)]
    pub kind: InputKind,
    /// Output type tags this input accepts. `None` accepts anything.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accepts: Option<Vec<String>>,
    /// Value used when the node has no literal for this field.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
}

impl InputField {
    pub fn text(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: InputKind::Text,
            accepts: None,
            default: None,
        }
    }

    pub fn number(name: impl Into<String>) -> Self {
        Self {
            kind: InputKind::Number,
            ..Self::text(name)
        }
    }

    pub fn select(name: impl Into<String>, options: &[&str]) -> Self {
        Self {
            kind: InputKind::Select {
                options: options.iter().map(|s| s.to_string()).collect(),
            },
            ..Self::text(name)
        }
    }

    pub fn wallet_address(name: impl Into<String>) -> Self {
        Self {
            kind: InputKind::WalletAddress,
            ..Self::text(name)
        }
    }

    /// Restrict which output type tags may connect to this input.
    pub fn accepting(mut self, types: &[&str]) -> Self {
        self.accepts = Some(types.iter().map(|s| s.to_string()).collect());
        self
    }

    pub fn with_default(mut self, value: impl Into<String>) -> Self {
        self.default = Some(value.into());
        self
    }

    pub fn is_wallet_address(&self) -> bool {
        matches!(self.kind, InputKind::WalletAddress)
    }
}

/// A declared block output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputField {
    pub name: String,
    /// Type tag used for connection compatibility only.
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub value_type: Option<String>,
}

impl OutputField {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value_type: None,
        }
    }

    pub fn typed(name: impl Into<String>, value_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value_type: Some(value_type.into()),
        }
    }
}

/// Static description of a block type: its category and declared fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockDefinition {
    #[serde(rename = "type")]
    pub block_type: String,
    pub category: BlockCategory,
    #[serde(default)]
    pub inputs: Vec<InputField>,
    #[serde(default)]
    pub outputs: Vec<OutputField>,
}

impl BlockDefinition {
    pub fn new(block_type: impl Into<String>, category: BlockCategory) -> Self {
        Self {
            block_type: block_type.into(),
            category,
            inputs: vec![],
            outputs: vec![],
        }
    }

    pub fn with_input(mut self, field: InputField) -> Self {
        self.inputs.push(field);
        self
    }

    pub fn with_output(mut self, field: OutputField) -> Self {
        self.outputs.push(field);
        self
    }

    pub fn input(&self, name: &str) -> Option<&InputField> {
        self.inputs.iter().find(|f| f.name == name)
    }

    pub fn output(&self, name: &str) -> Option<&OutputField> {
        self.outputs.iter().find(|f| f.name == name)
    }

    pub fn first_output(&self) -> Option<&OutputField> {
        self.outputs.first()
    }

    pub fn is_trigger(&self) -> bool {
        self.category == BlockCategory::Trigger
    }
}

/// Transaction handed to the caller's signer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRequest {
    pub to: String,
    #[serde(default)]
    pub data: Option<String>,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub chain_id: Option<u64>,
}

/// Capabilities injected by the caller for one run.
#[derive(Clone, Default)]
pub struct RunContext {
    pub wallet_address: Option<String>,
    pub signer: Option<Arc<dyn Signer>>,
}

impl RunContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_wallet(mut self, address: impl Into<String>) -> Self {
        self.wallet_address = Some(address.into());
        self
    }

    pub fn with_signer(mut self, signer: Arc<dyn Signer>) -> Self {
        self.signer = Some(signer);
        self
    }

    /// Submit a transaction through the injected signer.
    pub async fn send_transaction(&self, tx: TransactionRequest) -> Result<String> {
        let signer = self
            .signer
            .as_ref()
            .ok_or_else(|| BlockflowError::SignerUnavailable("send_transaction".into()))?;
        signer.send_transaction(tx).await
    }

    /// Sign EIP-712 style typed data through the injected signer.
    pub async fn sign_typed_data(&self, typed_data: serde_json::Value) -> Result<String> {
        let signer = self
            .signer
            .as_ref()
            .ok_or_else(|| BlockflowError::SignerUnavailable("sign_typed_data".into()))?;
        signer.sign_typed_data(typed_data).await
    }
}

impl std::fmt::Debug for RunContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunContext")
            .field("wallet_address", &self.wallet_address)
            .field("signer", &self.signer.is_some())
            .finish()
    }
}

/// Engine event broadcast to all subscribers.
#[derive(Debug, Clone)]
pub enum FlowEvent {
    /// A run started from `start_node`.
    RunStarted {
        run_id: RunId,
        start_node: String,
        at: DateTime<Utc>,
    },
    /// A node's block is about to run.
    NodeStarted { run_id: RunId, node_id: String },
    /// Live update: a node's outputs are known.
    NodeOutput {
        run_id: RunId,
        node_id: String,
        category: BlockCategory,
        outputs_json: String,
    },
    /// A node's block failed; its subtree will not run.
    NodeFailed {
        run_id: RunId,
        node_id: String,
        error: String,
    },
    /// A filter node stopped its branch.
    NodeHalted {
        run_id: RunId,
        node_id: String,
        reason: String,
    },
    /// A run finished.
    RunComplete {
        run_id: RunId,
        executed: usize,
        failed: usize,
        elapsed_ms: u64,
    },
    /// A trigger listener is live.
    SubscriptionOpened { agent_id: String, node_id: String },
    /// A trigger listener errored; `attempt` is the retry about to happen.
    SubscriptionError {
        agent_id: String,
        node_id: String,
        attempt: u32,
        error: String,
    },
    /// A trigger listener stopped.
    SubscriptionClosed { agent_id: String, node_id: String },
    /// A trigger firing was dropped by the overlap guard.
    TriggerSkipped { agent_id: String, node_id: String },
}
