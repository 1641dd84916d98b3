//! Debug renderings of a decoded stream: the textual dump and a
//! cycle-safe JSON view.

use crate::content::{ClassDesc, Content, ContentRef, FieldValue, Handle, Instance, JavaValue};
use crate::parser::StreamParser;
use hashbrown::{HashMap, HashSet};
use serde_json::{json, Map, Value};
use std::fmt::Write;

impl<'a> StreamParser<'a> {
    /// Renders the top-level contents, then every live instance in handle
    /// order.
    pub fn dump(&self, contents: &[ContentRef]) -> String {
        let mut out = String::new();

        out.push_str("//// BEGIN stream content output\n");
        for content in contents {
            let _ = writeln!(out, "{}", content.borrow());
        }
        out.push_str("//// END stream content output\n\n");

        out.push_str("//// BEGIN instance dump\n");
        for (_, content) in self.handles().contents() {
            if let Content::Instance(instance) = &*content.borrow() {
                dump_instance(instance, &mut out);
            }
        }
        out.push_str("//// END instance dump\n");
        out
    }
}

fn dump_instance(instance: &Instance, out: &mut String) {
    let mut names: HashMap<Handle, String> = HashMap::new();
    for class_desc in ClassDesc::hierarchy(&instance.class_desc) {
        let class_desc = class_desc.borrow();
        names.insert(class_desc.handle, class_desc.name.clone());
    }

    let _ = writeln!(
        out,
        "[instance 0x{:x}: 0x{:x} / {}",
        instance.handle,
        instance.class_desc.borrow().handle,
        instance.class_name()
    );

    if !instance.annotations.is_empty() {
        out.push_str("\tobject annotations:\n");
        for (handle, annotations) in &instance.annotations {
            let _ = writeln!(out, "\t{}", names.get(handle).cloned().unwrap_or_default());
            for content in annotations {
                let _ = writeln!(out, "\t\t{}", content.borrow());
            }
        }
    }

    if !instance.field_data.is_empty() {
        out.push_str("\tfield data:\n");
        for values in instance.field_data.values() {
            for (field_name, value) in values {
                match value {
                    FieldValue::Object(content) => match content.borrow().handle() {
                        Some(handle) if handle == instance.handle => {
                            let _ = writeln!(out, "\t\t{}: this", field_name);
                        }
                        Some(handle) => {
                            let _ = writeln!(out, "\t\t{}: r0x{:x}", field_name, handle);
                        }
                        None => {
                            let _ = writeln!(out, "\t\t{}: {}", field_name, content.borrow());
                        }
                    },
                    other => {
                        let _ = writeln!(out, "\t\t{}: {}", field_name, other);
                    }
                }
            }
        }
    }

    if let Some(value) = &instance.value {
        let _ = writeln!(out, "\tvalue: {:?}", value);
    }

    out.push_str("]\n");
}

/// Structural JSON for a decoded content tree. A handle seen twice renders
/// as `{"$ref": handle}`, so cyclic graphs terminate.
pub fn to_json(content: &ContentRef) -> Value {
    let mut visited = HashSet::new();
    json_content(content, &mut visited)
}

fn json_content(content: &ContentRef, visited: &mut HashSet<Handle>) -> Value {
    let content = content.borrow();
    if let Some(handle) = content.handle() {
        if !visited.insert(handle) {
            return json!({ "$ref": handle });
        }
    }

    match &*content {
        Content::Null => Value::Null,
        Content::BlockData(data) => json!({ "block_data": data }),
        Content::Str(string) => Value::String(string.value.clone()),
        Content::ClassDesc(class_desc) => {
            let class_desc = class_desc.borrow();
            json!({
                "class_desc": class_desc.name,
                "handle": class_desc.handle,
            })
        }
        Content::Class(class) => json!({
            "class": class
                .class_desc
                .as_ref()
                .map(|class_desc| class_desc.borrow().name.clone()),
            "handle": class.handle,
        }),
        Content::Array(array) => Value::Array(
            array
                .values
                .iter()
                .map(|value| json_field(value, visited))
                .collect(),
        ),
        Content::Enum(value) => json!({
            "enum": value.class_desc.borrow().name,
            "constant": value.constant_name(),
        }),
        Content::Instance(instance) => json_instance(instance, visited),
        Content::Exception(state) => json!({
            "exception": json_content(&state.instance, visited),
            "raw_bytes": state.raw.len(),
        }),
    }
}

fn json_instance(instance: &Instance, visited: &mut HashSet<Handle>) -> Value {
    let mut fields = Map::new();
    for values in instance.field_data.values() {
        for (name, value) in values {
            fields.insert(name.clone(), json_field(value, visited));
        }
    }

    let mut object = Map::new();
    object.insert("class".to_string(), Value::String(instance.class_name()));
    object.insert("handle".to_string(), json!(instance.handle));
    object.insert("fields".to_string(), Value::Object(fields));
    if let Some(value) = &instance.value {
        object.insert("value".to_string(), json_java_value(value, visited));
    }
    Value::Object(object)
}

fn json_java_value(value: &JavaValue, visited: &mut HashSet<Handle>) -> Value {
    match value {
        JavaValue::List(items) | JavaValue::Set(items) => Value::Array(
            items
                .iter()
                .map(|item| json_content(item, visited))
                .collect(),
        ),
        JavaValue::Map(entries) => Value::Array(
            entries
                .iter()
                .map(|(key, value)| {
                    Value::Array(vec![
                        json_content(key, visited),
                        json_content(value, visited),
                    ])
                })
                .collect(),
        ),
        JavaValue::Primitive(value) => json_field(value, visited),
        JavaValue::Time(time) => serde_json::to_value(time).unwrap_or(Value::Null),
    }
}

fn json_field(value: &FieldValue, visited: &mut HashSet<Handle>) -> Value {
    match value {
        FieldValue::Byte(value) => json!(value),
        FieldValue::Char(unit) => match std::char::from_u32(u32::from(*unit)) {
            Some(c) => Value::String(c.to_string()),
            None => json!(unit),
        },
        FieldValue::Double(value) => json!(value),
        FieldValue::Float(value) => json!(value),
        FieldValue::Int(value) => json!(value),
        FieldValue::Long(value) => json!(value),
        FieldValue::Short(value) => json!(value),
        FieldValue::Boolean(value) => json!(value),
        FieldValue::Object(content) => json_content(content, visited),
    }
}
