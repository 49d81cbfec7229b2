//! Explicit plan-node to operator factory table.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use strata_common::{OperatorId, Result, StrataError};

use crate::context::DriverContext;
use crate::operator::{Operator, ValuesOperator};
use crate::plan::{PlanNode, RowNumberNode, ValuesNode};
use crate::row_number::RowNumberOperator;

/// Translates plan nodes of one kind into operators.
pub trait OperatorFactory: Send + Sync {
    /// Node kind handled by the factory, matching [`PlanNode::kind`].
    fn kind(&self) -> &str;

    /// Build the operator for `node` at position `operator_id` of a driver.
    fn create(
        &self,
        node: &dyn PlanNode,
        operator_id: OperatorId,
        ctx: &Arc<DriverContext>,
    ) -> Result<Box<dyn Operator>>;
}

/// Plan-node to operator factory table.
///
/// A registry is built explicitly and handed to every [`DriverContext`];
/// there is no process-wide instance, so two drivers may use different
/// translations side by side.
#[derive(Default)]
pub struct OperatorRegistry {
    inner: RwLock<HashMap<String, Arc<dyn OperatorFactory>>>,
}

impl std::fmt::Debug for OperatorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperatorRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}

impl OperatorRegistry {
    /// Registry with the factories of this crate (`Values`, `RowNumber`).
    pub fn with_builtins() -> Self {
        let registry = Self::default();
        registry.register(Arc::new(ValuesFactory));
        registry.register(Arc::new(RowNumberFactory));
        registry
    }

    /// Register or replace a factory.
    ///
    /// Returns `true` when an existing factory for the same kind was replaced.
    pub fn register(&self, factory: Arc<dyn OperatorFactory>) -> bool {
        self.inner
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(factory.kind().to_string(), factory)
            .is_some()
    }

    /// Deregister the factory for `kind`.
    ///
    /// Returns `true` when an existing factory was removed.
    pub fn deregister(&self, kind: &str) -> bool {
        self.inner
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(kind)
            .is_some()
    }

    /// Fetch the factory for `kind`.
    pub fn get(&self, kind: &str) -> Option<Arc<dyn OperatorFactory>> {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(kind)
            .cloned()
    }

    /// Registered node kinds in sorted order.
    pub fn kinds(&self) -> Vec<String> {
        let mut kinds = self
            .inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect::<Vec<_>>();
        kinds.sort();
        kinds
    }

    /// Build the operator for `node`.
    pub fn create_operator(
        &self,
        node: &dyn PlanNode,
        operator_id: OperatorId,
        ctx: &Arc<DriverContext>,
    ) -> Result<Box<dyn Operator>> {
        let factory = self.get(node.kind()).ok_or_else(|| {
            StrataError::Unsupported(format!(
                "no operator factory registered for plan node kind '{}' (node {})",
                node.kind(),
                node.id()
            ))
        })?;
        factory.create(node, operator_id, ctx)
    }
}

/// Downcast a plan node handed to the factory of its kind.
pub fn downcast_node<'a, T: 'static>(node: &'a dyn PlanNode) -> Result<&'a T> {
    node.as_any().downcast_ref::<T>().ok_or_else(|| {
        StrataError::Internal(format!(
            "plan node {} of kind '{}' has an unexpected type",
            node.id(),
            node.kind()
        ))
    })
}

struct ValuesFactory;

impl OperatorFactory for ValuesFactory {
    fn kind(&self) -> &str {
        ValuesNode::KIND
    }

    fn create(
        &self,
        node: &dyn PlanNode,
        _operator_id: OperatorId,
        _ctx: &Arc<DriverContext>,
    ) -> Result<Box<dyn Operator>> {
        let values = downcast_node::<ValuesNode>(node)?;
        Ok(Box::new(ValuesOperator::new(
            values.output_schema(),
            values.batches().to_vec(),
        )))
    }
}

struct RowNumberFactory;

impl OperatorFactory for RowNumberFactory {
    fn kind(&self) -> &str {
        RowNumberNode::KIND
    }

    fn create(
        &self,
        node: &dyn PlanNode,
        operator_id: OperatorId,
        ctx: &Arc<DriverContext>,
    ) -> Result<Box<dyn Operator>> {
        let row_number = downcast_node::<RowNumberNode>(node)?;
        Ok(Box::new(RowNumberOperator::new(operator_id, ctx, row_number)?))
    }
}
