//! Systematic variables
//!
//! A [`SystematicVariable`] is a named column whose definition may change
//! per systematic. It is resolved lazily: only when the graph builder knows
//! which systematic is active and which physical names its inputs carry.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use crate::domain::error::{BuildError, BuildResult};
use crate::domain::expr::Expression;
use crate::domain::namer::Systematic;

/// Native column function, called with input values in declaration order.
pub type ColumnFn = Arc<dyn Fn(&[f64]) -> f64 + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VariableKind {
    /// Alias of a column that exists in the dataset
    ExistingBranch,
    /// New column computed by a native function
    ComputedBranch,
    /// New column computed from a string expression
    StringExpression,
}

/// Unresolved definition over logical column names.
#[derive(Clone)]
pub enum DefinitionSpec {
    /// Physical dataset column, read as-is
    Branch(String),
    Function { func: ColumnFn, inputs: Vec<String> },
    Expression(Expression),
}

impl DefinitionSpec {
    pub fn kind(&self) -> VariableKind {
        match self {
            DefinitionSpec::Branch(_) => VariableKind::ExistingBranch,
            DefinitionSpec::Function { .. } => VariableKind::ComputedBranch,
            DefinitionSpec::Expression(_) => VariableKind::StringExpression,
        }
    }

    /// Logical columns this definition reads.
    pub fn inputs(&self) -> Vec<&str> {
        match self {
            DefinitionSpec::Branch(_) => Vec::new(),
            DefinitionSpec::Function { inputs, .. } => inputs.iter().map(String::as_str).collect(),
            DefinitionSpec::Expression(expr) => expr.columns().iter().map(String::as_str).collect(),
        }
    }
}

impl fmt::Debug for DefinitionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DefinitionSpec::Branch(column) => f.debug_tuple("Branch").field(column).finish(),
            DefinitionSpec::Function { inputs, .. } => f
                .debug_struct("Function")
                .field("inputs", inputs)
                .finish_non_exhaustive(),
            DefinitionSpec::Expression(expr) => {
                f.debug_tuple("Expression").field(&expr.source()).finish()
            }
        }
    }
}

/// Definition resolved for one systematic, over physical column names.
#[derive(Clone)]
pub enum Definition {
    Column(String),
    Function {
        func: ColumnFn,
        inputs: Vec<String>,
    },
    /// `text` is the rewritten source; `inputs[i]` is bound to
    /// `expression.columns()[i]`.
    Expression {
        text: String,
        expression: Expression,
        inputs: Vec<String>,
    },
}

impl Definition {
    /// Physical columns read by this definition.
    pub fn inputs(&self) -> &[String] {
        match self {
            Definition::Column(column) => std::slice::from_ref(column),
            Definition::Function { inputs, .. } | Definition::Expression { inputs, .. } => inputs,
        }
    }

    /// Evaluate for one row, `values` aligned with [`inputs`](Self::inputs).
    pub fn eval(&self, values: &[f64]) -> f64 {
        match self {
            Definition::Column(_) => values.first().copied().unwrap_or(f64::NAN),
            Definition::Function { func, .. } => func(values),
            Definition::Expression { expression, .. } => expression.eval(values),
        }
    }
}

impl fmt::Display for Definition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Definition::Column(column) => f.write_str(column),
            Definition::Function { inputs, .. } => write!(f, "fn({})", inputs.join(", ")),
            Definition::Expression { text, .. } => f.write_str(text),
        }
    }
}

impl fmt::Debug for Definition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Definition({self})")
    }
}

/// A column (or filter predicate) whose definition may vary per systematic.
#[derive(Debug, Clone)]
pub struct SystematicVariable {
    name: String,
    nominal: DefinitionSpec,
    overrides: BTreeMap<String, DefinitionSpec>,
    cost: Option<f64>,
}

impl SystematicVariable {
    fn with_spec(name: impl Into<String>, nominal: DefinitionSpec) -> Self {
        Self {
            name: name.into(),
            nominal,
            overrides: BTreeMap::new(),
            cost: None,
        }
    }

    /// Dataset column read under its own name.
    pub fn existing(name: impl Into<String>) -> Self {
        let name = name.into();
        let column = name.clone();
        Self::with_spec(name, DefinitionSpec::Branch(column))
    }

    /// Logical name for a dataset column with a different physical name.
    pub fn alias(name: impl Into<String>, column: impl Into<String>) -> Self {
        Self::with_spec(name, DefinitionSpec::Branch(column.into()))
    }

    pub fn computed<F>(name: impl Into<String>, inputs: &[&str], func: F) -> Self
    where
        F: Fn(&[f64]) -> f64 + Send + Sync + 'static,
    {
        Self::with_spec(
            name,
            DefinitionSpec::Function {
                func: Arc::new(func),
                inputs: inputs.iter().map(|s| s.to_string()).collect(),
            },
        )
    }

    pub fn expression(name: impl Into<String>, text: &str) -> BuildResult<Self> {
        Ok(Self::with_spec(
            name,
            DefinitionSpec::Expression(Expression::parse(text)?),
        ))
    }

    pub fn vary_branch(mut self, systematic: &str, column: impl Into<String>) -> Self {
        self.overrides
            .insert(systematic.to_string(), DefinitionSpec::Branch(column.into()));
        self
    }

    pub fn vary_function<F>(mut self, systematic: &str, inputs: &[&str], func: F) -> Self
    where
        F: Fn(&[f64]) -> f64 + Send + Sync + 'static,
    {
        self.overrides.insert(
            systematic.to_string(),
            DefinitionSpec::Function {
                func: Arc::new(func),
                inputs: inputs.iter().map(|s| s.to_string()).collect(),
            },
        );
        self
    }

    pub fn vary_expression(mut self, systematic: &str, text: &str) -> BuildResult<Self> {
        self.overrides.insert(
            systematic.to_string(),
            DefinitionSpec::Expression(Expression::parse(text)?),
        );
        Ok(self)
    }

    /// Relative evaluation cost hint used for construction ordering.
    pub fn with_cost(mut self, cost: f64) -> Self {
        self.cost = Some(cost);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> VariableKind {
        self.nominal.kind()
    }

    pub fn cost(&self) -> Option<f64> {
        self.cost
    }

    pub fn validate_cost(&self) -> BuildResult<()> {
        match self.cost {
            Some(cost) if !cost.is_finite() || cost < 0.0 => Err(BuildError::InvalidCost {
                owner: self.name.clone(),
                cost,
            }),
            _ => Ok(()),
        }
    }

    pub fn nominal(&self) -> &DefinitionSpec {
        &self.nominal
    }

    /// Systematics with an explicit override on this variable.
    pub fn override_systematics(&self) -> impl Iterator<Item = &str> {
        self.overrides.keys().map(String::as_str)
    }

    pub fn spec_for(&self, systematic: &Systematic) -> &DefinitionSpec {
        match systematic {
            Systematic::Nominal => &self.nominal,
            Systematic::Variation(name) => self.overrides.get(name).unwrap_or(&self.nominal),
        }
    }

    /// `true` if this variable is read straight from the dataset under `systematic`.
    pub fn is_source(&self, systematic: &Systematic) -> bool {
        matches!(self.spec_for(systematic), DefinitionSpec::Branch(_))
    }

    /// Logical inputs over the nominal and every override.
    pub fn all_inputs(&self) -> BTreeSet<&str> {
        std::iter::once(&self.nominal)
            .chain(self.overrides.values())
            .flat_map(DefinitionSpec::inputs)
            .collect()
    }

    /// Resolve for `systematic`, mapping logical inputs to physical names
    /// through `lookup` (which answers for the same systematic).
    ///
    /// `location` names the node the variable is resolved at, for errors.
    pub fn resolve<F>(
        &self,
        systematic: &Systematic,
        mut lookup: F,
        location: &str,
    ) -> BuildResult<Definition>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let mut physical = |logical: &str| {
            lookup(logical).ok_or_else(|| BuildError::SystematicResolution {
                variable: self.name.clone(),
                systematic: systematic.to_string(),
                missing: logical.to_string(),
                path: location.to_string(),
            })
        };
        match self.spec_for(systematic) {
            DefinitionSpec::Branch(column) => Ok(Definition::Column(column.clone())),
            DefinitionSpec::Function { func, inputs } => Ok(Definition::Function {
                func: Arc::clone(func),
                inputs: inputs
                    .iter()
                    .map(|input| physical(input))
                    .collect::<BuildResult<_>>()?,
            }),
            DefinitionSpec::Expression(expression) => {
                let inputs = expression
                    .columns()
                    .iter()
                    .map(|input| physical(input))
                    .collect::<BuildResult<Vec<_>>>()?;
                let text = expression.rewrite(|logical| {
                    let slot = expression
                        .columns()
                        .iter()
                        .position(|c| c == logical)
                        .unwrap_or_default();
                    inputs[slot].clone()
                });
                Ok(Definition::Expression {
                    text,
                    expression: expression.clone(),
                    inputs,
                })
            }
        }
    }
}
