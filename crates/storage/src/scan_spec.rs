//! What a scan reads from each column.

use arrow_schema::DataType;
use strata_common::{Result, StrataError};

use crate::filter::Filter;
use crate::value_hook::SharedValueHook;

/// Per-column scan settings.
#[derive(Clone)]
pub struct ColumnSpec {
    /// Column name in the table schema.
    pub name: String,
    pub filter: Option<Filter>,
    /// True when the column appears in the output.
    pub projected: bool,
    /// Keep dictionary-encoded row groups as dictionary vectors.
    pub keep_dictionary: bool,
    /// Target vector type; `None` keeps the stored type.
    pub output_type: Option<DataType>,
    pub value_hook: Option<SharedValueHook>,
    /// Specs of struct children; empty reads every child.
    pub children: Vec<ColumnSpec>,
}

impl std::fmt::Debug for ColumnSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ColumnSpec")
            .field("name", &self.name)
            .field("filter", &self.filter)
            .field("projected", &self.projected)
            .field("keep_dictionary", &self.keep_dictionary)
            .field("output_type", &self.output_type)
            .field("value_hook", &self.value_hook.is_some())
            .field("children", &self.children)
            .finish()
    }
}

impl ColumnSpec {
    /// Projected column without a filter.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            filter: None,
            projected: true,
            keep_dictionary: false,
            output_type: None,
            value_hook: None,
            children: Vec::new(),
        }
    }

    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn with_projected(mut self, projected: bool) -> Self {
        self.projected = projected;
        self
    }

    pub fn with_keep_dictionary(mut self, keep: bool) -> Self {
        self.keep_dictionary = keep;
        self
    }

    pub fn with_output_type(mut self, data_type: DataType) -> Self {
        self.output_type = Some(data_type);
        self
    }

    /// Feed the column's values to `hook` instead of projecting them.
    pub fn with_value_hook(mut self, hook: SharedValueHook) -> Self {
        self.value_hook = Some(hook);
        self.projected = false;
        self
    }

    pub fn with_children(mut self, children: Vec<ColumnSpec>) -> Self {
        self.children = children;
        self
    }

    /// True when this column or a struct child filters rows.
    pub fn has_filter(&self) -> bool {
        self.filter.is_some() || self.children.iter().any(ColumnSpec::has_filter)
    }

    /// Spec of child `name`, or a plain projected spec when none was given.
    pub fn child(&self, name: &str) -> Option<ColumnSpec> {
        if self.children.is_empty() {
            return Some(ColumnSpec::new(name));
        }
        self.children.iter().find(|c| c.name == name).cloned()
    }

    fn validate(&self) -> Result<()> {
        if self.value_hook.is_some() && self.filter.is_some() {
            return Err(StrataError::InvalidConfig(format!(
                "column {} cannot have both a filter and a value hook",
                self.name
            )));
        }
        if self.value_hook.is_some() && !self.children.is_empty() {
            return Err(StrataError::InvalidConfig(format!(
                "value hook on struct column {} is not supported",
                self.name
            )));
        }
        for child in &self.children {
            if child.value_hook.is_some() {
                return Err(StrataError::InvalidConfig(format!(
                    "value hook on struct child {}.{} is not supported",
                    self.name, child.name
                )));
            }
            child.validate()?;
        }
        Ok(())
    }
}

/// Columns of one scan in read order.
#[derive(Debug, Clone, Default)]
pub struct ScanSpec {
    columns: Vec<ColumnSpec>,
    /// Positions in `columns` of the projected columns, in the given order.
    projection: Vec<usize>,
}

impl ScanSpec {
    /// Scan over `columns`. Filtering columns are read first, keeping the
    /// given order within filtering and non-filtering columns; hook columns
    /// come last so they only see rows that passed every filter.
    pub fn try_new(columns: Vec<ColumnSpec>) -> Result<Self> {
        if columns.is_empty() {
            return Err(StrataError::InvalidConfig(
                "a scan needs at least one column".to_string(),
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for c in &columns {
            c.validate()?;
            if !seen.insert(c.name.as_str()) {
                return Err(StrataError::InvalidConfig(format!(
                    "column {} appears twice in the scan",
                    c.name
                )));
            }
        }
        let mut order = (0..columns.len()).collect::<Vec<_>>();
        order.sort_by_key(|i| {
            let c = &columns[*i];
            match (c.has_filter(), c.value_hook.is_some()) {
                (true, _) => 0,
                (false, false) => 1,
                (false, true) => 2,
            }
        });
        let mut position = vec![0; columns.len()];
        for (read_pos, original) in order.iter().enumerate() {
            position[*original] = read_pos;
        }
        let projection = columns
            .iter()
            .enumerate()
            .filter(|(_, c)| c.projected)
            .map(|(i, _)| position[i])
            .collect();
        let mut slots = columns.into_iter().map(Some).collect::<Vec<_>>();
        let columns = order
            .iter()
            .filter_map(|i| slots[*i].take())
            .collect();
        Ok(Self {
            columns,
            projection,
        })
    }

    /// Columns in read order.
    pub fn columns(&self) -> &[ColumnSpec] {
        &self.columns
    }

    /// Read positions of the projected columns, in output order.
    pub fn projection(&self) -> &[usize] {
        &self.projection
    }

    /// Projected columns, in output order.
    pub fn projected(&self) -> impl Iterator<Item = &ColumnSpec> {
        self.projection.iter().map(|i| &self.columns[*i])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value_hook::{shared_hook, CountHook};

    #[test]
    fn filter_columns_are_read_first() {
        let spec = ScanSpec::try_new(vec![
            ColumnSpec::new("a"),
            ColumnSpec::new("n").with_value_hook(shared_hook(CountHook::new(false))),
            ColumnSpec::new("b").with_filter(Filter::IsNotNull),
            ColumnSpec::new("c"),
        ])
        .expect("spec");
        let names = spec.columns().iter().map(|c| c.name.as_str()).collect::<Vec<_>>();
        assert_eq!(names, vec!["b", "a", "c", "n"]);
        let projected = spec.projected().map(|c| c.name.as_str()).collect::<Vec<_>>();
        assert_eq!(projected, vec!["a", "b", "c"]);
        assert_eq!(spec.projection(), &[1, 0, 2]);
    }

    #[test]
    fn rejects_hook_with_filter_and_duplicates() {
        let hooked = ColumnSpec::new("a")
            .with_value_hook(shared_hook(CountHook::new(false)))
            .with_filter(Filter::IsNotNull);
        assert!(ScanSpec::try_new(vec![hooked]).is_err());
        assert!(ScanSpec::try_new(vec![ColumnSpec::new("a"), ColumnSpec::new("a")]).is_err());
    }
}
