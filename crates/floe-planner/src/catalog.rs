use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use serde_json::{json, Value};

use floe_core::error::{FloeError, Result};
use floe_runtime::{Node, SchemaValidator};

/// Why a tool's arguments were rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgsError {
    pub node: String,
    /// Required fields that were absent or null.
    pub missing: Vec<String>,
    pub message: String,
}

impl fmt::Display for ArgsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid args for '{}': {}", self.node, self.message)
    }
}

/// A node exposed to the planner as a tool.
pub struct NodeSpec {
    node: Arc<Node>,
    description: String,
    args_validator: Option<Arc<SchemaValidator>>,
    out_schema: Option<Value>,
    tags: BTreeSet<String>,
}

impl NodeSpec {
    /// Expose `node`. Its input schema, if any, doubles as the args schema.
    pub fn new(node: Node) -> Self {
        Self {
            description: node.description().to_string(),
            node: Arc::new(node),
            args_validator: None,
            out_schema: None,
            tags: BTreeSet::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_args_schema(mut self, schema: Value) -> Result<Self> {
        self.args_validator = Some(Arc::new(SchemaValidator::compile(schema)?));
        Ok(self)
    }

    pub fn with_out_schema(mut self, schema: Value) -> Self {
        self.out_schema = Some(schema);
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    pub fn name(&self) -> &str {
        self.node.name()
    }

    pub fn node(&self) -> &Arc<Node> {
        &self.node
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn tags(&self) -> &BTreeSet<String> {
        &self.tags
    }

    fn validator(&self) -> Option<&SchemaValidator> {
        self.args_validator.as_deref().or_else(|| self.node.input_schema())
    }

    pub fn args_schema(&self) -> Option<&Value> {
        self.validator().map(|v| v.schema())
    }

    pub fn validate_args(&self, args: &Value) -> std::result::Result<(), ArgsError> {
        let Some(validator) = self.validator() else {
            return Ok(());
        };
        validator.validate(args).map_err(|message| ArgsError {
            node: self.name().to_string(),
            missing: validator.missing_required(args),
            message,
        })
    }

    /// Description used in the planner prompt.
    pub fn describe(&self) -> Value {
        let mut value = json!({
            "name": self.name(),
            "description": self.description,
        });
        if let Some(schema) = self.args_schema() {
            value["args_schema"] = schema.clone();
        }
        if let Some(schema) = &self.out_schema {
            value["out_schema"] = schema.clone();
        }
        if !self.tags.is_empty() {
            value["tags"] = json!(self.tags);
        }
        value
    }
}

impl fmt::Debug for NodeSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeSpec")
            .field("name", &self.name())
            .field("tags", &self.tags)
            .finish()
    }
}

/// Which tools a run may see.
#[derive(Debug, Clone, Default)]
pub struct ToolPolicy {
    allowed: Option<BTreeSet<String>>,
    denied: BTreeSet<String>,
    required_tags: BTreeSet<String>,
}

impl ToolPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Only the named tools are visible.
    pub fn allow_only<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed = Some(names.into_iter().map(Into::into).collect());
        self
    }

    pub fn deny(mut self, name: impl Into<String>) -> Self {
        self.denied.insert(name.into());
        self
    }

    /// Tools must carry every one of these tags.
    pub fn require_tag(mut self, tag: impl Into<String>) -> Self {
        self.required_tags.insert(tag.into());
        self
    }

    pub fn permits(&self, spec: &NodeSpec) -> bool {
        let name = spec.name();
        if self.denied.contains(name) {
            return false;
        }
        if let Some(allowed) = &self.allowed {
            if !allowed.contains(name) {
                return false;
            }
        }
        self.required_tags.is_subset(spec.tags())
    }
}

/// Tools the planner may call, by name.
#[derive(Debug, Clone, Default)]
pub struct ToolCatalog {
    tools: BTreeMap<String, Arc<NodeSpec>>,
}

impl ToolCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, spec: NodeSpec) -> Result<()> {
        let name = spec.name().to_string();
        if self.tools.contains_key(&name) {
            return Err(FloeError::DuplicateNode(name));
        }
        self.tools.insert(name, Arc::new(spec));
        Ok(())
    }

    pub fn with(mut self, spec: NodeSpec) -> Result<Self> {
        self.register(spec)?;
        Ok(self)
    }

    pub fn get(&self, name: &str) -> Option<Arc<NodeSpec>> {
        self.tools.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.tools.keys().map(|s| s.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// A catalog holding only the tools `policy` permits.
    pub fn filtered(&self, policy: &ToolPolicy) -> Self {
        Self {
            tools: self
                .tools
                .iter()
                .filter(|(_, spec)| policy.permits(spec))
                .map(|(name, spec)| (name.clone(), Arc::clone(spec)))
                .collect(),
        }
    }

    pub fn describe(&self) -> Value {
        Value::Array(self.tools.values().map(|spec| spec.describe()).collect())
    }
}
