//! Conversions between host-side JSON trees and VM values.

use rquickjs::convert::Coerced;
use rquickjs::{Array, Ctx, FromJs, IntoJs, Object, Result as JsResult, Value};
use serde_json::Value as Json;

/// Builds a VM value from a JSON tree. Integers that fit an i32 stay exact
/// ints; everything else becomes a float.
pub(crate) fn json_to_js<'js>(ctx: &Ctx<'js>, value: &Json) -> JsResult<Value<'js>> {
    match value {
        Json::Null => Ok(Value::new_null(ctx.clone())),
        Json::Bool(b) => Ok(Value::new_bool(ctx.clone(), *b)),
        Json::Number(n) => {
            if let Some(i) = n.as_i64() {
                if let Ok(small) = i32::try_from(i) {
                    return Ok(Value::new_int(ctx.clone(), small));
                }
                return Ok(Value::new_float(ctx.clone(), i as f64));
            }
            Ok(Value::new_float(ctx.clone(), n.as_f64().unwrap_or(f64::NAN)))
        }
        Json::String(s) => s.as_str().into_js(ctx),
        Json::Array(items) => {
            let arr = Array::new(ctx.clone())?;
            for (i, item) in items.iter().enumerate() {
                arr.set(i, json_to_js(ctx, item)?)?;
            }
            Ok(arr.into_value())
        }
        Json::Object(map) => {
            let obj = Object::new(ctx.clone())?;
            for (key, item) in map {
                obj.set(key.as_str(), json_to_js(ctx, item)?)?;
            }
            Ok(obj.into_value())
        }
    }
}

/// JS ToString coercion with a placeholder for values that refuse it.
pub(crate) fn coerce_display<'js>(ctx: &Ctx<'js>, value: Value<'js>) -> String {
    match Coerced::<String>::from_js(ctx, value) {
        Ok(Coerced(s)) => s,
        Err(_) => "<non-string>".to_string(),
    }
}

/// JS truthiness for host-side verdicts.
pub(crate) fn js_truthy(value: &Value<'_>) -> bool {
    if value.is_undefined() || value.is_null() {
        return false;
    }
    if let Some(b) = value.as_bool() {
        return b;
    }
    if let Some(i) = value.as_int() {
        return i != 0;
    }
    if let Some(f) = value.as_float() {
        return f != 0.0 && !f.is_nan();
    }
    if let Some(s) = value.as_string() {
        return s.to_string().map(|s| !s.is_empty()).unwrap_or(true);
    }
    true
}
