//! 工具参数 Schema 与校验（schemars 自动生成）
//!
//! 每个内置工具用一个 `#[derive(Deserialize, JsonSchema)]` 参数结构体；
//! schema 绑定给模型，同一结构体在执行时做严格反序列化校验。

use schemars::{schema_for, JsonSchema};
use serde::de::DeserializeOwned;
use serde_json::Value;

/// 返回参数结构体的 JSON Schema（对象形式，可直接放入 tools 声明）
pub fn args_schema<T: JsonSchema>() -> Value {
    let schema = schema_for!(T);
    serde_json::to_value(&schema).unwrap_or_else(|_| {
        serde_json::json!({
            "type": "object",
            "properties": {}
        })
    })
}

/// 按参数结构体校验并解析；缺省参数（null）视为空对象
pub fn parse_args<T: DeserializeOwned>(args: Value) -> Result<T, String> {
    let args = if args.is_null() {
        Value::Object(Default::default())
    } else {
        args
    };
    serde_json::from_value(args).map_err(|e| format!("invalid arguments: {e}"))
}
