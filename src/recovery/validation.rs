//! 执行前校验：按顺序运行规则，汇总错误、警告与可自动修复的参数
//!
//! 规则分两类问题：硬错误（无法修复，直接拒绝）与可修复问题（给出修正后的参数）。
//! suggested_fix 是完整的修正后参数对象，调用方直接替换原参数即可。

use serde::Serialize;
use serde_json::{Map, Value};

use crate::memory::MemoryPressure;
use crate::substrate::{Operation, OperationKind};

/// 网格默认弦差
pub const DEFAULT_TOLERANCE: f64 = 0.1;
/// 单个尺寸参数的上限
pub const MAX_DIMENSION: f64 = 1.0e6;

#[derive(Debug, Clone, Copy, Default)]
pub struct ValidationContext {
    pub pressure: MemoryPressure,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    /// 所有错误都有修正方案
    pub fixable: bool,
    pub suggested_fix: Option<Value>,
    #[serde(skip)]
    hard_errors: usize,
}

impl ValidationReport {
    pub fn hard_error(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
        self.hard_errors += 1;
    }

    /// 记录一个可修复问题，并把修正写入 suggested_fix
    pub fn fixable_error(&mut self, operation: &Operation, message: impl Into<String>, key: &str, value: Value) {
        self.errors.push(message.into());
        self.patch(operation, key, value);
    }

    pub fn warning(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }

    /// 在 suggested_fix 上修改一个字段（首次修改时从原参数复制）
    pub fn patch(&mut self, operation: &Operation, key: &str, value: Value) {
        let fix = self.suggested_fix.get_or_insert_with(|| match operation.params() {
            Value::Object(map) => Value::Object(map.clone()),
            _ => Value::Object(Map::new()),
        });
        if let Value::Object(map) = fix {
            map.insert(key.to_string(), value);
        }
    }

    /// 修正后参数中的数值（后面的规则基于前面规则的修正继续检查）
    fn current_f64(&self, operation: &Operation, key: &str) -> Option<f64> {
        match &self.suggested_fix {
            Some(fix) => fix.get(key).and_then(Value::as_f64),
            None => operation.param_f64(key),
        }
    }

    fn finish(mut self) -> Self {
        self.valid = self.errors.is_empty();
        self.fixable = !self.valid && self.hard_errors == 0 && self.suggested_fix.is_some();
        self
    }
}

pub trait ValidationRule: Send + Sync {
    fn name(&self) -> &'static str;

    fn check(&self, operation: &Operation, context: &ValidationContext, report: &mut ValidationReport);
}

/// 必填字段
pub struct RequiredFieldsRule;

impl ValidationRule for RequiredFieldsRule {
    fn name(&self) -> &'static str {
        "required_fields"
    }

    fn check(&self, operation: &Operation, _context: &ValidationContext, report: &mut ValidationReport) {
        let required = operation.kind().required_fields();
        if !required.is_empty() && !operation.params().is_object() {
            report.hard_error(format!("{} expects an object of parameters", operation.name()));
            return;
        }
        for field in required {
            match operation.param(field) {
                None | Some(Value::Null) => report.hard_error(format!(
                    "Missing required field '{}' for {}",
                    field,
                    operation.name()
                )),
                Some(_) => {}
            }
        }
    }
}

/// 尺寸参数：零或非数值是硬错误，负数取绝对值，超大截断
pub struct GeometricBoundsRule {
    pub max_dimension: f64,
}

impl Default for GeometricBoundsRule {
    fn default() -> Self {
        Self {
            max_dimension: MAX_DIMENSION,
        }
    }
}

impl ValidationRule for GeometricBoundsRule {
    fn name(&self) -> &'static str {
        "geometric_bounds"
    }

    fn check(&self, operation: &Operation, _context: &ValidationContext, report: &mut ValidationReport) {
        for field in operation.kind().dimension_fields() {
            let Some(raw) = operation.param(field) else {
                continue;
            };
            let Some(value) = raw.as_f64() else {
                report.hard_error(format!("'{}' must be a number", field));
                continue;
            };
            if !value.is_finite() || value == 0.0 {
                report.hard_error(format!("'{}' must be a finite non-zero number", field));
            } else if value < 0.0 {
                let fixed = value.abs().min(self.max_dimension);
                report.fixable_error(
                    operation,
                    format!("'{}' is negative ({})", field, value),
                    field,
                    Value::from(fixed),
                );
            } else if value > self.max_dimension {
                report.fixable_error(
                    operation,
                    format!("'{}' exceeds {} ({})", field, self.max_dimension, value),
                    field,
                    Value::from(self.max_dimension),
                );
            }
        }
    }
}

/// 网格弦差必须为正
pub struct TessellationToleranceRule;

impl ValidationRule for TessellationToleranceRule {
    fn name(&self) -> &'static str {
        "tessellation_tolerance"
    }

    fn check(&self, operation: &Operation, _context: &ValidationContext, report: &mut ValidationReport) {
        if *operation.kind() != OperationKind::Tessellate {
            return;
        }
        let Some(raw) = operation.param("tolerance") else {
            return;
        };
        match raw.as_f64() {
            Some(t) if t > 0.0 && t.is_finite() => {}
            _ => report.fixable_error(
                operation,
                format!("Tessellation tolerance must be positive, got {}", raw),
                "tolerance",
                Value::from(DEFAULT_TOLERANCE),
            ),
        }
    }
}

/// 内存紧张时：放粗网格精度、提示重操作
pub struct MemoryPressureRule;

impl ValidationRule for MemoryPressureRule {
    fn name(&self) -> &'static str {
        "memory_pressure"
    }

    fn check(&self, operation: &Operation, context: &ValidationContext, report: &mut ValidationReport) {
        if context.pressure != MemoryPressure::Critical {
            return;
        }
        match operation.kind() {
            OperationKind::Tessellate => {
                let current = report
                    .current_f64(operation, "tolerance")
                    .filter(|t| *t > 0.0)
                    .unwrap_or(DEFAULT_TOLERANCE);
                let coarse = current.max(DEFAULT_TOLERANCE) * 2.0;
                report.warning(format!(
                    "Critical memory pressure: tessellation tolerance coarsened to {}",
                    coarse
                ));
                report.patch(operation, "tolerance", Value::from(coarse));
            }
            kind if kind.is_heavy() => {
                report.warning(format!(
                    "Critical memory pressure: {} may fail or be slow",
                    operation.name()
                ));
            }
            _ => {}
        }
    }
}

/// 有序规则集
pub struct Validator {
    rules: Vec<Box<dyn ValidationRule>>,
}

impl Default for Validator {
    fn default() -> Self {
        Self {
            rules: vec![
                Box::new(RequiredFieldsRule),
                Box::new(GeometricBoundsRule::default()),
                Box::new(TessellationToleranceRule),
                Box::new(MemoryPressureRule),
            ],
        }
    }
}

impl Validator {
    pub fn with_rule(mut self, rule: Box<dyn ValidationRule>) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn validate(&self, operation: &Operation, context: &ValidationContext) -> ValidationReport {
        let mut report = ValidationReport::default();
        for rule in &self.rules {
            rule.check(operation, context, &mut report);
        }
        report.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn validate(name: &str, params: Value) -> ValidationReport {
        Validator::default().validate(&Operation::new(name, params), &ValidationContext::default())
    }

    #[test]
    fn test_valid_box() {
        let report = validate("MAKE_BOX", json!({"width": 1.0, "height": 2.0, "depth": 3.0}));
        assert!(report.valid);
        assert!(report.suggested_fix.is_none());
    }

    #[test]
    fn test_missing_field_is_hard_error() {
        let report = validate("MAKE_BOX", json!({"width": 1.0, "height": 2.0}));
        assert!(!report.valid);
        assert!(!report.fixable);
        assert!(report.errors[0].contains("depth"));
    }

    #[test]
    fn test_zero_dimension_is_hard_error() {
        let report = validate("MAKE_SPHERE", json!({"radius": 0.0}));
        assert!(!report.valid);
        assert!(!report.fixable);
    }

    #[test]
    fn test_negative_dimension_fixable() {
        let report = validate("MAKE_SPHERE", json!({"radius": -5.0}));
        assert!(!report.valid);
        assert!(report.fixable);
        assert_eq!(report.suggested_fix.unwrap()["radius"], 5.0);
    }

    #[test]
    fn test_oversize_dimension_clamped() {
        let report = validate("MAKE_CYLINDER", json!({"radius": 1.0, "height": 5.0e7}));
        assert!(report.fixable);
        let fix = report.suggested_fix.unwrap();
        assert_eq!(fix["height"], MAX_DIMENSION);
        assert_eq!(fix["radius"], 1.0);
    }

    #[test]
    fn test_non_positive_tolerance_fixed() {
        let report = validate("TESSELLATE", json!({"shapeId": "s", "tolerance": -1.0}));
        assert!(report.fixable);
        assert_eq!(report.suggested_fix.unwrap()["tolerance"], DEFAULT_TOLERANCE);
    }

    #[test]
    fn test_critical_pressure_coarsens_tessellation() {
        let op = Operation::new("TESSELLATE", json!({"shapeId": "s", "tolerance": 0.05}));
        let ctx = ValidationContext {
            pressure: MemoryPressure::Critical,
        };
        let report = Validator::default().validate(&op, &ctx);
        assert!(report.valid);
        assert_eq!(report.warnings.len(), 1);
        assert_eq!(report.suggested_fix.unwrap()["tolerance"], 0.2);
    }

    #[test]
    fn test_critical_pressure_warns_on_heavy_operations() {
        let ctx = ValidationContext {
            pressure: MemoryPressure::Critical,
        };
        let boolean = Operation::new("BOOLEAN_SUBTRACT", json!({"base": "a", "tool": "b"}));
        let report = Validator::default().validate(&boolean, &ctx);
        assert!(report.valid);
        assert_eq!(report.warnings.len(), 1);
        assert!(report.suggested_fix.is_none());

        let fillet = Operation::new("FILLET", json!({"shape": "s", "radius": 1.0}));
        let report = Validator::default().validate(&fillet, &ctx);
        assert_eq!(report.warnings.len(), 1);
        assert!(report.warnings[0].contains("FILLET"));

        let primitive = Operation::new("MAKE_SPHERE", json!({"radius": 1.0}));
        assert!(Validator::default().validate(&primitive, &ctx).warnings.is_empty());
    }

    #[test]
    fn test_unknown_operation_passes() {
        let report = validate("CUSTOM_OP", json!(42));
        assert!(report.valid);
    }
}
