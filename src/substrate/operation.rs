//! 操作词表：操作名 → OperationKind
//!
//! 操作名是开放的字符串词表（MAKE_BOX、BOOLEAN_UNION、TESSELLATE …），执行层不解释其语义，
//! 只按 kind 决定必填字段、优先级、是否可缓存。未知名字落到 `Other`，按最保守的方式处理。

use serde_json::Value;
use sha2::{Digest, Sha256};

/// 已知操作种类；匹配处必须穷举，新增种类时编译器会指出所有需要补充的地方
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum OperationKind {
    MakeBox,
    MakeSphere,
    MakeCylinder,
    MakeCone,
    MakeTorus,
    BooleanUnion,
    BooleanSubtract,
    BooleanIntersect,
    Extrude,
    Revolve,
    Fillet,
    Chamfer,
    Transform,
    Tessellate,
    ExportStep,
    ExportStl,
    ImportStep,
    Other(String),
}

impl OperationKind {
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_ascii_uppercase().as_str() {
            "MAKE_BOX" => Self::MakeBox,
            "MAKE_SPHERE" => Self::MakeSphere,
            "MAKE_CYLINDER" => Self::MakeCylinder,
            "MAKE_CONE" => Self::MakeCone,
            "MAKE_TORUS" => Self::MakeTorus,
            "BOOLEAN_UNION" => Self::BooleanUnion,
            "BOOLEAN_SUBTRACT" => Self::BooleanSubtract,
            "BOOLEAN_INTERSECT" => Self::BooleanIntersect,
            "EXTRUDE" => Self::Extrude,
            "REVOLVE" => Self::Revolve,
            "FILLET" => Self::Fillet,
            "CHAMFER" => Self::Chamfer,
            "TRANSFORM" => Self::Transform,
            "TESSELLATE" => Self::Tessellate,
            "EXPORT_STEP" => Self::ExportStep,
            "EXPORT_STL" => Self::ExportStl,
            "IMPORT_STEP" => Self::ImportStep,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::MakeBox => "MAKE_BOX",
            Self::MakeSphere => "MAKE_SPHERE",
            Self::MakeCylinder => "MAKE_CYLINDER",
            Self::MakeCone => "MAKE_CONE",
            Self::MakeTorus => "MAKE_TORUS",
            Self::BooleanUnion => "BOOLEAN_UNION",
            Self::BooleanSubtract => "BOOLEAN_SUBTRACT",
            Self::BooleanIntersect => "BOOLEAN_INTERSECT",
            Self::Extrude => "EXTRUDE",
            Self::Revolve => "REVOLVE",
            Self::Fillet => "FILLET",
            Self::Chamfer => "CHAMFER",
            Self::Transform => "TRANSFORM",
            Self::Tessellate => "TESSELLATE",
            Self::ExportStep => "EXPORT_STEP",
            Self::ExportStl => "EXPORT_STL",
            Self::ImportStep => "IMPORT_STEP",
            Self::Other(name) => name,
        }
    }

    /// 必填参数
    pub fn required_fields(&self) -> &'static [&'static str] {
        match self {
            Self::MakeBox => &["width", "height", "depth"],
            Self::MakeSphere => &["radius"],
            Self::MakeCylinder => &["radius", "height"],
            Self::MakeCone => &["radius1", "radius2", "height"],
            Self::MakeTorus => &["radius1", "radius2"],
            Self::BooleanUnion | Self::BooleanSubtract | Self::BooleanIntersect => {
                &["base", "tool"]
            }
            Self::Extrude => &["profile", "distance"],
            Self::Revolve => &["profile", "angle"],
            Self::Fillet => &["shape", "radius"],
            Self::Chamfer => &["shape", "distance"],
            Self::Transform => &["shape"],
            Self::Tessellate => &["shapeId"],
            Self::ExportStep | Self::ExportStl => &["shape"],
            Self::ImportStep => &["data"],
            Self::Other(_) => &[],
        }
    }

    /// 必须为正的尺寸参数（几何边界校验使用）
    pub fn dimension_fields(&self) -> &'static [&'static str] {
        match self {
            Self::MakeBox => &["width", "height", "depth"],
            Self::MakeSphere => &["radius"],
            Self::MakeCylinder => &["radius", "height"],
            Self::MakeCone => &["radius1", "height"],
            Self::MakeTorus => &["radius1", "radius2"],
            Self::Fillet => &["radius"],
            Self::Chamfer => &["distance"],
            _ => &[],
        }
    }

    /// 默认优先级：既用于任务排队，也用于缓存淘汰评分
    pub fn default_priority(&self) -> u32 {
        match self {
            Self::Tessellate => 8,
            Self::BooleanUnion | Self::BooleanSubtract | Self::BooleanIntersect => 7,
            Self::Extrude | Self::Revolve | Self::Fillet | Self::Chamfer => 6,
            Self::MakeBox
            | Self::MakeSphere
            | Self::MakeCylinder
            | Self::MakeCone
            | Self::MakeTorus
            | Self::Transform => 5,
            Self::ImportStep => 4,
            Self::ExportStep | Self::ExportStl => 3,
            Self::Other(_) => 5,
        }
    }

    /// 结果能否进入通用结果缓存；TESSELLATE 走网格缓存，导入导出与未知操作不缓存
    pub fn is_cacheable(&self) -> bool {
        !matches!(
            self,
            Self::Tessellate | Self::ExportStep | Self::ExportStl | Self::ImportStep | Self::Other(_)
        )
    }

    /// 计算量大、在高内存压力下需要额外关注的操作
    pub fn is_heavy(&self) -> bool {
        matches!(
            self,
            Self::BooleanUnion
                | Self::BooleanSubtract
                | Self::BooleanIntersect
                | Self::Fillet
                | Self::Chamfer
                | Self::Tessellate
        )
    }
}

/// 一次待执行的操作（种类 + 参数）；入队后不可变
#[derive(Debug, Clone, PartialEq)]
pub struct Operation {
    kind: OperationKind,
    params: Value,
}

impl Operation {
    pub fn new(name: impl AsRef<str>, params: Value) -> Self {
        Self {
            kind: OperationKind::from_name(name.as_ref()),
            params,
        }
    }

    pub fn kind(&self) -> &OperationKind {
        &self.kind
    }

    pub fn name(&self) -> &str {
        self.kind.name()
    }

    pub fn params(&self) -> &Value {
        &self.params
    }

    /// 替换参数（自动修复、恢复策略放宽参数时使用）
    pub fn with_params(&self, params: Value) -> Self {
        Self {
            kind: self.kind.clone(),
            params,
        }
    }

    pub fn param(&self, key: &str) -> Option<&Value> {
        self.params.get(key)
    }

    pub fn param_f64(&self, key: &str) -> Option<f64> {
        self.params.get(key).and_then(Value::as_f64)
    }

    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(Value::as_str)
    }

    /// 确定性缓存键：操作名 + 规范化参数（键排序）的 SHA-256 摘要
    pub fn cache_key(&self) -> String {
        let mut canonical = String::new();
        write_canonical(&self.params, &mut canonical);

        let mut hasher = Sha256::new();
        hasher.update(self.name().as_bytes());
        hasher.update(b"\0");
        hasher.update(canonical.as_bytes());
        let digest = hex::encode(hasher.finalize());
        format!("{}:{}", self.name(), &digest[..32])
    }
}

/// 与 serde_json 是否开启 preserve_order 无关的规范化序列化
fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_kind_from_name() {
        assert_eq!(OperationKind::from_name("make_box"), OperationKind::MakeBox);
        assert_eq!(OperationKind::from_name("TESSELLATE"), OperationKind::Tessellate);
        assert_eq!(
            OperationKind::from_name("LOFT"),
            OperationKind::Other("LOFT".to_string())
        );
        assert_eq!(OperationKind::from_name("LOFT").name(), "LOFT");
    }

    #[test]
    fn test_cache_key_is_order_independent() {
        let a = Operation::new("MAKE_BOX", json!({"width": 1, "height": 2, "depth": 3}));
        let b = Operation::new("MAKE_BOX", json!({"depth": 3, "width": 1, "height": 2}));
        assert_eq!(a.cache_key(), b.cache_key());
        assert!(a.cache_key().starts_with("MAKE_BOX:"));

        let c = Operation::new("MAKE_BOX", json!({"width": 1, "height": 2, "depth": 4}));
        assert_ne!(a.cache_key(), c.cache_key());

        let d = Operation::new("MAKE_SPHERE", json!({"width": 1, "height": 2, "depth": 3}));
        assert_ne!(a.cache_key(), d.cache_key());
    }

    #[test]
    fn test_cacheability() {
        assert!(OperationKind::MakeBox.is_cacheable());
        assert!(!OperationKind::Tessellate.is_cacheable());
        assert!(!OperationKind::Other("X".into()).is_cacheable());
        assert!(OperationKind::BooleanUnion.is_heavy());
    }
}
