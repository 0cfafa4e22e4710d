//! Output field definitions and per-interval reduction.
//!
//! Each aggregate field names where its per-record value comes from (a
//! formula, a raw field, or a constant) and which [`Reducer`] folds the
//! collected values of one interval into the single output value.
//!
//! # Job file shape
//!
//! ```json
//! { "name": "temp_avg", "type": "expression", "expression": "(t_in + t_out) / 2",
//!   "reducer": "average", "precision": 1 }
//! { "name": "humidity", "type": "direct", "field": "hum", "reducer": "max" }
//! { "name": "source",   "type": "constant", "constant": "$aggregator_id" }
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};

use crate::error::{ConfigError, ExpressionError};
use crate::expr::Expression;
use crate::record::{Fields, TIMESTAMP_KEY, value_as_f64};

/// Built-in constant resolving to the aggregator's name.
pub const AGGREGATOR_ID: &str = "$aggregator_id";

/// Built-in constant resolving to the aggregation period in seconds.
pub const AGGREGATION_PERIOD: &str = "$aggregation_period";

/// Default number of decimal places kept in float results.
pub const DEFAULT_PRECISION: u32 = 2;

/// Largest accepted precision; beyond this `f64` has no digits left to round.
const MAX_PRECISION: u32 = 15;

fn default_precision() -> u32 {
    DEFAULT_PRECISION
}

/// How an interval's collected values reduce to one output value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Reducer {
    /// Number of non-null values.
    Count,
    /// Sum of numeric values.
    Sum,
    /// Smallest numeric value.
    Min,
    /// Largest numeric value.
    Max,
    /// First value in timestamp order.
    First,
    /// Last value in timestamp order.
    Last,
    /// The first value captured; used with constant fields.
    #[default]
    Constant,
    /// Mean of the numeric values.
    Average,
}

impl Reducer {
    /// True for reducers that only look at numeric values.
    pub fn is_statistical(self) -> bool {
        matches!(self, Self::Sum | Self::Min | Self::Max | Self::Average)
    }

    /// Reduces the accumulated statistics of one field.
    ///
    /// Returns `None` when the reducer has nothing to report, for example
    /// `average` or `min` over an interval with no numeric values. Float
    /// results are rounded to `precision` decimal places.
    pub fn reduce(self, stat: &FieldStat, precision: u32) -> Option<Value> {
        match self {
            Self::Count => Some(Value::from(stat.count)),
            Self::Sum if stat.has_numeric() => float_value(stat.sum, precision),
            Self::Sum => None,
            Self::Min => float_value(stat.min, precision),
            Self::Max => float_value(stat.max, precision),
            Self::First | Self::Constant => stat.first.as_ref().map(|v| round_value(v, precision)),
            Self::Last => stat.last.as_ref().map(|v| round_value(v, precision)),
            Self::Average => {
                if !stat.has_numeric() {
                    return None;
                }
                #[allow(clippy::cast_precision_loss)] // counts far below 2^53
                float_value(stat.sum / stat.numeric as f64, precision)
            }
        }
    }
}

/// Accumulated values of one field within one interval.
///
/// `min` and `max` start at +∞ and −∞ and stay there until the first numeric
/// value arrives; a reducer reading them at that point yields nothing.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldStat {
    /// Non-null values seen, numeric or not.
    pub count: u64,
    /// Values that were numeric.
    pub numeric: u64,
    /// Sum of numeric values.
    pub sum: f64,
    /// Smallest numeric value.
    pub min: f64,
    /// Largest numeric value.
    pub max: f64,
    /// First non-null value.
    pub first: Option<Value>,
    /// Last non-null value.
    pub last: Option<Value>,
}

impl Default for FieldStat {
    fn default() -> Self {
        Self {
            count: 0,
            numeric: 0,
            sum: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            first: None,
            last: None,
        }
    }
}

impl FieldStat {
    /// Folds one value into the statistics.
    ///
    /// Nulls are ignored. Returns `false` if the value was counted but is
    /// not numeric, so it did not reach `sum`, `min` or `max`.
    pub fn add(&mut self, value: Value) -> bool {
        if value.is_null() {
            return true;
        }
        let numeric = value_as_f64(&value);
        if self.first.is_none() {
            self.first = Some(value.clone());
        }
        self.last = Some(value);
        self.count += 1;

        let Some(x) = numeric else {
            return false;
        };
        self.numeric += 1;
        self.sum += x;
        self.min = self.min.min(x);
        self.max = self.max.max(x);
        true
    }

    /// True once at least one numeric value has been folded in.
    pub fn has_numeric(&self) -> bool {
        self.numeric > 0
    }
}

/// Rounds half away from zero to `precision` decimal places.
pub fn round_to(value: f64, precision: u32) -> f64 {
    let scale = 10f64.powi(i32::try_from(precision).unwrap_or(i32::MAX));
    let rounded = (value * scale).round() / scale;
    if rounded.is_finite() { rounded } else { value }
}

fn float_value(value: f64, precision: u32) -> Option<Value> {
    if !value.is_finite() {
        return None;
    }
    Number::from_f64(round_to(value, precision)).map(Value::Number)
}

/// Rounds a `first`/`last` value if it is a non-integer number.
fn round_value(value: &Value, precision: u32) -> Value {
    match value {
        Value::Number(n) if !n.is_i64() && !n.is_u64() => n
            .as_f64()
            .and_then(|x| float_value(x, precision))
            .unwrap_or_else(|| value.clone()),
        other => other.clone(),
    }
}

/// A constant field value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "Value", into = "Value")]
pub enum ConstantValue {
    /// A literal written as-is.
    Literal(Value),
    /// The aggregator's name.
    AggregatorId,
    /// The aggregation period in seconds.
    AggregationPeriod,
}

impl From<Value> for ConstantValue {
    fn from(value: Value) -> Self {
        match value.as_str() {
            Some(AGGREGATOR_ID) => Self::AggregatorId,
            Some(AGGREGATION_PERIOD) => Self::AggregationPeriod,
            _ => Self::Literal(value),
        }
    }
}

impl From<ConstantValue> for Value {
    fn from(constant: ConstantValue) -> Self {
        match constant {
            ConstantValue::Literal(value) => value,
            ConstantValue::AggregatorId => Value::from(AGGREGATOR_ID),
            ConstantValue::AggregationPeriod => Value::from(AGGREGATION_PERIOD),
        }
    }
}

/// Where a field's per-record value comes from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum FieldSource {
    /// A formula over the record's numeric fields.
    Expression {
        /// The parsed formula.
        expression: Expression,
    },
    /// A raw field passed through unchanged.
    Direct {
        /// Raw field to read; defaults to the output field name.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        field: Option<String>,
    },
    /// The same value for every record.
    Constant {
        /// The value.
        constant: ConstantValue,
    },
}

/// Per-record context a [`FieldSource`] may need besides the record itself.
#[derive(Debug, Clone, Copy)]
pub struct SourceContext<'a> {
    /// Name of the aggregator evaluating the field.
    pub aggregator: &'a str,
    /// Aggregation period in seconds.
    pub period: u64,
}

/// Definition of one aggregate output field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDef {
    /// Output field name.
    pub name: String,
    /// Where per-record values come from.
    #[serde(flatten)]
    pub source: FieldSource,
    /// How an interval's values are reduced.
    #[serde(default)]
    pub reducer: Reducer,
    /// Decimal places kept in float results.
    #[serde(default = "default_precision")]
    pub precision: u32,
}

impl FieldDef {
    /// Creates a field with the default precision.
    pub fn new(name: impl Into<String>, source: FieldSource, reducer: Reducer) -> Self {
        Self {
            name: name.into(),
            source,
            reducer,
            precision: DEFAULT_PRECISION,
        }
    }

    /// Validates this field definition.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidField`] if the name is empty or reserved,
    /// the direct source names an empty field, or the precision is too large.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidField {
            field: self.name.clone(),
            reason: reason.to_string(),
        };

        if self.name.trim().is_empty() {
            return Err(invalid("name cannot be empty"));
        }
        if self.name == TIMESTAMP_KEY {
            return Err(invalid("'timestamp' is reserved"));
        }
        if let FieldSource::Direct { field: Some(field) } = &self.source
            && field.trim().is_empty()
        {
            return Err(invalid("direct source field cannot be empty"));
        }
        if self.precision > MAX_PRECISION {
            return Err(invalid(&format!("precision must be at most {MAX_PRECISION}")));
        }
        Ok(())
    }

    /// Raw field read by a direct source.
    pub fn source_field(&self) -> Option<&str> {
        match &self.source {
            FieldSource::Direct { field } => Some(field.as_deref().unwrap_or(&self.name)),
            _ => None,
        }
    }

    /// Computes this field's value for one record.
    ///
    /// Returns `Ok(None)` when the record has nothing for the field, and
    /// `Err` when a formula cannot be evaluated against this record.
    ///
    /// # Errors
    ///
    /// Returns [`ExpressionError`] from formula evaluation.
    pub fn value_for(
        &self,
        fields: &Fields,
        context: SourceContext<'_>,
    ) -> Result<Option<Value>, ExpressionError> {
        Ok(match &self.source {
            FieldSource::Expression { expression } => {
                Number::from_f64(expression.evaluate(fields)?).map(Value::Number)
            }
            FieldSource::Direct { .. } => {
                let name = self.source_field().unwrap_or(&self.name);
                fields.get(name).filter(|v| !v.is_null()).cloned()
            }
            FieldSource::Constant { constant } => Some(match constant {
                ConstantValue::Literal(value) => value.clone(),
                ConstantValue::AggregatorId => Value::from(context.aggregator),
                ConstantValue::AggregationPeriod => Value::from(context.period),
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn stat_of(values: &[Value]) -> FieldStat {
        let mut stat = FieldStat::default();
        for value in values {
            stat.add(value.clone());
        }
        stat
    }

    fn context() -> SourceContext<'static> {
        SourceContext {
            aggregator: "hourly",
            period: 3600,
        }
    }

    #[test]
    fn test_reducers() {
        let stat = stat_of(&[json!(10), json!("20"), json!(null), json!(3)]);
        assert_eq!(Reducer::Count.reduce(&stat, 2), Some(json!(3)));
        assert_eq!(Reducer::Sum.reduce(&stat, 2), Some(json!(33.0)));
        assert_eq!(Reducer::Min.reduce(&stat, 2), Some(json!(3.0)));
        assert_eq!(Reducer::Max.reduce(&stat, 2), Some(json!(20.0)));
        assert_eq!(Reducer::First.reduce(&stat, 2), Some(json!(10)));
        assert_eq!(Reducer::Last.reduce(&stat, 2), Some(json!(3)));
        assert_eq!(Reducer::Average.reduce(&stat, 2), Some(json!(11.0)));
    }

    #[test]
    fn test_non_numeric_counted_but_not_summed() {
        let mut stat = FieldStat::default();
        assert!(stat.add(json!(4)));
        assert!(!stat.add(json!("cloudy")));
        assert_eq!(stat.count, 2);
        assert_eq!(stat.numeric, 1);
        assert_eq!(Reducer::Average.reduce(&stat, 2), Some(json!(4.0)));
        assert_eq!(Reducer::Last.reduce(&stat, 2), Some(json!("cloudy")));
    }

    #[test]
    fn test_no_numeric_values_reduce_to_nothing() {
        let stat = stat_of(&[json!("a"), json!(true)]);
        assert_eq!(Reducer::Average.reduce(&stat, 2), None);
        assert_eq!(Reducer::Min.reduce(&stat, 2), None);
        assert_eq!(Reducer::Max.reduce(&stat, 2), None);
        assert_eq!(Reducer::Sum.reduce(&stat, 2), None);
        assert_eq!(Reducer::Count.reduce(&stat, 2), Some(json!(2)));
    }

    #[test]
    fn test_rounding() {
        assert_eq!(round_to(2.346, 2), 2.35);
        assert_eq!(round_to(-2.5, 0), -3.0);
        assert_eq!(round_to(1.0 / 3.0, 3), 0.333);

        let stat = stat_of(&[json!(1.23456), json!(7)]);
        assert_eq!(Reducer::First.reduce(&stat, 1), Some(json!(1.2)));
        assert_eq!(Reducer::Last.reduce(&stat, 1), Some(json!(7)));
    }

    #[test]
    fn test_deserialize_field_defs() {
        let defs: Vec<FieldDef> = serde_json::from_value(json!([
            {"name": "avg", "type": "expression", "expression": "a + b", "reducer": "average", "precision": 1},
            {"name": "hum", "type": "direct", "field": "humidity", "reducer": "max"},
            {"name": "temp", "type": "direct", "reducer": "last"},
            {"name": "by", "type": "constant", "constant": "$aggregator_id"},
            {"name": "label", "type": "constant", "constant": "station-1"}
        ]))
        .unwrap();

        assert_eq!(defs[0].precision, 1);
        assert!(matches!(defs[0].source, FieldSource::Expression { .. }));
        assert_eq!(defs[1].source_field(), Some("humidity"));
        assert_eq!(defs[2].source_field(), Some("temp"));
        assert_eq!(defs[2].precision, DEFAULT_PRECISION);
        assert_eq!(defs[3].reducer, Reducer::Constant);
        assert_eq!(
            defs[3].source,
            FieldSource::Constant {
                constant: ConstantValue::AggregatorId
            }
        );
        assert_eq!(
            defs[4].source,
            FieldSource::Constant {
                constant: ConstantValue::Literal(json!("station-1"))
            }
        );
    }

    #[test]
    fn test_bad_formula_rejected_at_load() {
        let result: Result<FieldDef, _> = serde_json::from_value(
            json!({"name": "x", "type": "expression", "expression": "1 +", "reducer": "sum"}),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_validate() {
        let direct = |name: &str, field: Option<&str>| {
            FieldDef::new(
                name,
                FieldSource::Direct {
                    field: field.map(String::from),
                },
                Reducer::Last,
            )
        };
        assert!(direct("temp", None).validate().is_ok());
        assert!(direct("", None).validate().is_err());
        assert!(direct("timestamp", None).validate().is_err());
        assert!(direct("temp", Some(" ")).validate().is_err());

        let mut def = direct("temp", None);
        def.precision = 40;
        assert!(def.validate().is_err());
    }

    #[test]
    fn test_value_for_each_source() {
        let mut fields = Fields::new();
        fields.insert("raw".into(), json!(4));
        fields.insert("out".into(), json!(99));

        let expr = FieldDef::new(
            "double",
            FieldSource::Expression {
                expression: Expression::parse("raw * 2").unwrap(),
            },
            Reducer::Sum,
        );
        assert_eq!(expr.value_for(&fields, context()).unwrap(), Some(json!(8.0)));

        let direct = FieldDef::new(
            "out",
            FieldSource::Direct {
                field: Some("raw".into()),
            },
            Reducer::Last,
        );
        assert_eq!(direct.value_for(&fields, context()).unwrap(), Some(json!(4)));

        let period = FieldDef::new(
            "period",
            FieldSource::Constant {
                constant: ConstantValue::AggregationPeriod,
            },
            Reducer::Constant,
        );
        assert_eq!(period.value_for(&fields, context()).unwrap(), Some(json!(3600)));

        let missing = FieldDef::new(
            "x",
            FieldSource::Expression {
                expression: Expression::parse("nope + 1").unwrap(),
            },
            Reducer::Sum,
        );
        assert!(missing.value_for(&fields, context()).is_err());
    }
}
