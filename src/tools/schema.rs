//! 工具参数 JSON Schema：schemars 生成 + 调用前校验
//!
//! 校验只覆盖工具参数用得到的子集：对象形状、required、未声明的键、基本类型、数值上下界。
//! 不认识的 schema 关键字（$ref / anyOf 等）跳过，交由工具自身反序列化兜底。

use std::collections::HashMap;

use schemars::{schema_for, JsonSchema};
use serde_json::{Map, Value};

/// 工具调用请求格式：与推理解析的 `{"tool": "...", "args": {...}}` 一致（仅用于 Schema 生成）
#[allow(dead_code)]
#[derive(JsonSchema)]
struct ToolCallFormat {
    /// 工具名，如 lookup_term、get_glossary；不调用工具时为空字符串
    pub tool: String,
    /// 工具参数，依工具不同而不同
    pub args: HashMap<String, Value>,
}

/// 返回工具调用的 JSON Schema 字符串，可拼入 system prompt
pub fn tool_call_schema_json() -> String {
    let schema = schema_for!(ToolCallFormat);
    serde_json::to_string_pretty(&schema).unwrap_or_default()
}

/// 由参数结构体生成 schema（Tool::parameters_schema 的常用实现）
pub fn args_schema<T: JsonSchema>() -> Value {
    serde_json::to_value(schema_for!(T)).unwrap_or_else(|_| {
        serde_json::json!({ "type": "object", "properties": {}, "required": [] })
    })
}

/// 按 schema 校验参数；返回第一个不合法之处
pub fn validate_args(schema: &Value, args: &Map<String, Value>) -> Result<(), String> {
    let empty = Map::new();
    let properties = schema
        .get("properties")
        .and_then(Value::as_object)
        .unwrap_or(&empty);

    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        for key in required.iter().filter_map(Value::as_str) {
            match args.get(key) {
                None | Some(Value::Null) => return Err(format!("missing required argument: {key}")),
                Some(_) => {}
            }
        }
    }

    for (key, value) in args {
        let Some(prop) = properties.get(key) else {
            return Err(format!("unknown argument: {key}"));
        };
        check_type(key, prop, value)?;
        check_bounds(key, prop, value)?;
    }
    Ok(())
}

fn type_matches(ty: &str, value: &Value) -> bool {
    match ty {
        "string" => value.is_string(),
        "integer" => value.is_i64() || value.is_u64(),
        "number" => value.is_number(),
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        "null" => value.is_null(),
        _ => true,
    }
}

fn check_type(key: &str, prop: &Value, value: &Value) -> Result<(), String> {
    let ok = match prop.get("type") {
        Some(Value::String(ty)) => type_matches(ty, value),
        // Option<T> 生成 ["string", "null"]
        Some(Value::Array(types)) => types
            .iter()
            .filter_map(Value::as_str)
            .any(|ty| type_matches(ty, value)),
        _ => true,
    };
    if ok {
        Ok(())
    } else {
        Err(format!("argument {key} has wrong type"))
    }
}

fn check_bounds(key: &str, prop: &Value, value: &Value) -> Result<(), String> {
    let Some(n) = value.as_f64() else {
        return Ok(());
    };
    if let Some(min) = prop.get("minimum").and_then(Value::as_f64) {
        if n < min {
            return Err(format!("argument {key} must be >= {min}"));
        }
    }
    if let Some(max) = prop.get("maximum").and_then(Value::as_f64) {
        if n > max {
            return Err(format!("argument {key} must be <= {max}"));
        }
    }
    Ok(())
}
