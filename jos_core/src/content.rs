//! The decoded content model: a tagged union of everything a stream can
//! carry, plus the class descriptor and field records.
//!
//! Referenceable entities live in shared slots (`Rc<RefCell<..>>`) owned by
//! the handle table; back-references clone the slot, so cyclic object
//! graphs resolve without re-reading.

use crate::error::{ParseError, ParseResult};
use crate::tag::{FieldType, SC_SERIALIZABLE};
use crate::time::JavaTime;
use hashbrown::HashSet;
use indexmap::IndexMap;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

pub type Handle = u32;
pub type ContentRef = Rc<RefCell<Content>>;
pub type ClassDescRef = Rc<RefCell<ClassDesc>>;

pub enum Content {
    Null,
    BlockData(Vec<u8>),
    Str(JavaString),
    ClassDesc(ClassDescRef),
    Class(JavaClass),
    Array(JavaArray),
    Enum(JavaEnum),
    Instance(Instance),
    Exception(ExceptionState),
}

impl Content {
    #[inline]
    pub fn into_ref(self) -> ContentRef {
        Rc::new(RefCell::new(self))
    }

    /// Handle of the entity, if this variant is referenceable.
    pub fn handle(&self) -> Option<Handle> {
        match self {
            Content::Str(string) => Some(string.handle),
            Content::ClassDesc(desc) => Some(desc.borrow().handle),
            Content::Class(class) => Some(class.handle),
            Content::Array(array) => Some(array.handle),
            Content::Enum(value) => Some(value.handle),
            Content::Instance(instance) => Some(instance.handle),
            Content::Null | Content::BlockData(_) | Content::Exception(_) => None,
        }
    }

    /// True for an instance decoded under an exception frame.
    pub fn is_exception(&self) -> bool {
        match self {
            Content::Instance(instance) => instance.is_exception,
            _ => false,
        }
    }

    /// Structural checks run over every handle-table entry once the stream
    /// has been fully read.
    pub fn validate(&self) -> ParseResult<()> {
        match self {
            Content::Enum(value) => value.validate(),
            Content::Instance(instance) => instance.validate(),
            _ => Ok(()),
        }
    }
}

pub struct JavaString {
    pub handle: Handle,
    pub value: String,
}

pub struct JavaClass {
    pub handle: Handle,
    pub class_desc: Option<ClassDescRef>,
}

pub struct JavaArray {
    pub handle: Handle,
    pub class_desc: ClassDescRef,
    pub field_type: FieldType,
    pub values: Vec<FieldValue>,
}

pub struct JavaEnum {
    pub handle: Handle,
    pub class_desc: ClassDescRef,
    /// The constant name, always a `Content::Str`.
    pub constant: ContentRef,
}

impl JavaEnum {
    pub fn constant_name(&self) -> Option<String> {
        match &*self.constant.borrow() {
            Content::Str(string) => Some(string.value.clone()),
            _ => None,
        }
    }

    fn validate(&self) -> ParseResult<()> {
        let constant = self
            .constant_name()
            .ok_or_else(|| ParseError::ValidationFailed("enum constant is not a string".to_string()))?;
        if !self.class_desc.borrow().enum_constants.contains(&constant) {
            return Err(ParseError::ValidationFailed(format!(
                "enum constant {} is not recorded in its descriptor",
                constant
            )));
        }
        Ok(())
    }
}

pub struct Instance {
    pub handle: Handle,
    pub class_desc: ClassDescRef,
    /// Field values per ancestor descriptor handle, hierarchy order, fields
    /// in declaration order.
    pub field_data: IndexMap<Handle, IndexMap<String, FieldValue>>,
    /// Write-method / externalizable annotations per ancestor descriptor
    /// handle.
    pub annotations: IndexMap<Handle, Vec<ContentRef>>,
    pub is_exception: bool,
    /// Native value produced by an instance carrier, if a transformer
    /// claimed the class.
    pub value: Option<JavaValue>,
}

impl Instance {
    pub fn new(handle: Handle, class_desc: ClassDescRef) -> Instance {
        Instance {
            handle,
            class_desc,
            field_data: IndexMap::new(),
            annotations: IndexMap::new(),
            is_exception: false,
            value: None,
        }
    }

    pub fn class_name(&self) -> String {
        self.class_desc.borrow().name.clone()
    }

    fn validate(&self) -> ParseResult<()> {
        for class_desc in ClassDesc::hierarchy(&self.class_desc) {
            let class_desc = class_desc.borrow();
            if class_desc.flags & SC_SERIALIZABLE == 0 {
                continue;
            }
            if let Some(values) = self.field_data.get(&class_desc.handle) {
                let matches = values.len() == class_desc.fields.len()
                    && class_desc.fields.iter().all(|field| values.contains_key(&field.name));
                if !matches {
                    return Err(ParseError::ValidationFailed(format!(
                        "field data of {} does not match its declared fields",
                        class_desc.name
                    )));
                }
            }
        }
        Ok(())
    }
}

pub struct ExceptionState {
    /// The instance that was thrown, `is_exception` set.
    pub instance: ContentRef,
    /// Raw stream bytes from the exception tag to the end of the instance.
    pub raw: Vec<u8>,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ClassDescKind {
    Normal,
    Proxy,
}

pub struct ClassDesc {
    pub kind: ClassDescKind,
    pub handle: Handle,
    /// Empty for proxy descriptors.
    pub name: String,
    pub serial_version_uid: i64,
    pub flags: u8,
    /// Locally declared fields; inherited fields come from `super_class`.
    pub fields: Vec<JavaField>,
    /// Proxy descriptors carry interface names instead of fields.
    pub interfaces: Vec<String>,
    pub annotations: Vec<ContentRef>,
    pub super_class: Option<ClassDescRef>,
    /// Constant names observed on enums of this class.
    pub enum_constants: HashSet<String>,
}

impl ClassDesc {
    pub fn normal(
        name: String,
        serial_version_uid: i64,
        handle: Handle,
        flags: u8,
        fields: Vec<JavaField>,
    ) -> ClassDesc {
        ClassDesc {
            kind: ClassDescKind::Normal,
            handle,
            name,
            serial_version_uid,
            flags,
            fields,
            interfaces: Vec::new(),
            annotations: Vec::new(),
            super_class: None,
            enum_constants: HashSet::new(),
        }
    }

    pub fn proxy(handle: Handle, interfaces: Vec<String>) -> ClassDesc {
        ClassDesc {
            kind: ClassDescKind::Proxy,
            handle,
            name: String::new(),
            serial_version_uid: 0,
            flags: 0,
            fields: Vec::new(),
            interfaces,
            annotations: Vec::new(),
            super_class: None,
            enum_constants: HashSet::new(),
        }
    }

    /// The class chain in super-first order. A super chain that loops back
    /// on itself (malformed input) is cut at the first revisited handle.
    pub fn hierarchy(this: &ClassDescRef) -> Vec<ClassDescRef> {
        let mut chain = Vec::new();
        let mut seen = HashSet::new();
        let mut cursor = Some(this.clone());
        while let Some(class_desc) = cursor {
            if !seen.insert(class_desc.borrow().handle) {
                break;
            }
            cursor = class_desc.borrow().super_class.clone();
            chain.push(class_desc);
        }
        chain.reverse();
        chain
    }
}

pub struct JavaField {
    pub field_type: FieldType,
    pub name: String,
    /// For object and array fields, the JVM type signature string.
    pub class_name: Option<ContentRef>,
}

impl JavaField {
    pub fn signature(&self) -> Option<String> {
        let class_name = self.class_name.as_ref()?;
        match &*class_name.borrow() {
            Content::Str(string) => Some(string.value.clone()),
            _ => None,
        }
    }
}

/// A single decoded field or array element.
#[derive(Clone)]
pub enum FieldValue {
    Byte(i8),
    Char(u16),
    Double(f64),
    Float(f32),
    Int(i32),
    Long(i64),
    Short(i16),
    Boolean(bool),
    Object(ContentRef),
}

/// Native value a default carrier distills out of a well-known class.
pub enum JavaValue {
    List(Vec<ContentRef>),
    Map(Vec<(ContentRef, ContentRef)>),
    Set(Vec<ContentRef>),
    Primitive(FieldValue),
    Time(JavaTime),
}

// Display stays shallow on purpose: references render as `r0x..` so cyclic
// graphs terminate.

impl fmt::Display for Content {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Content::Null => write!(f, "null"),
            Content::BlockData(data) => write!(f, "[blockdata: {} bytes]", data.len()),
            Content::Str(string) => write!(f, "[str 0x{:x}: {:?}]", string.handle, string.value),
            Content::ClassDesc(desc) => {
                let desc = desc.borrow();
                match desc.kind {
                    ClassDescKind::Normal => {
                        write!(f, "[classdesc 0x{:x}: {}]", desc.handle, desc.name)
                    }
                    ClassDescKind::Proxy => write!(
                        f,
                        "[proxyclassdesc 0x{:x}: {}]",
                        desc.handle,
                        desc.interfaces.join(", ")
                    ),
                }
            }
            Content::Class(class) => {
                let name = class
                    .class_desc
                    .as_ref()
                    .map(|desc| desc.borrow().name.clone())
                    .unwrap_or_else(|| "<null>".to_string());
                write!(f, "[class 0x{:x}: {}]", class.handle, name)
            }
            Content::Array(array) => write!(
                f,
                "[array 0x{:x}: {} x {}]",
                array.handle,
                array.values.len(),
                array.field_type.type_char()
            ),
            Content::Enum(value) => write!(
                f,
                "[enum 0x{:x}: {}]",
                value.handle,
                value.constant_name().unwrap_or_default()
            ),
            Content::Instance(instance) => write!(
                f,
                "[instance 0x{:x}: 0x{:x} / {}]",
                instance.handle,
                instance.class_desc.borrow().handle,
                instance.class_name()
            ),
            Content::Exception(state) => write!(
                f,
                "[exception ({} raw bytes): {}]",
                state.raw.len(),
                state.instance.borrow()
            ),
        }
    }
}

impl fmt::Debug for Content {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FieldValue::Byte(value) => write!(f, "{}", value),
            FieldValue::Char(unit) => match char::from_u32(u32::from(*unit)) {
                Some(c) => write!(f, "{:?}", c),
                None => write!(f, "\\u{:04x}", unit),
            },
            FieldValue::Double(value) => write!(f, "{}", value),
            FieldValue::Float(value) => write!(f, "{}", value),
            FieldValue::Int(value) => write!(f, "{}", value),
            FieldValue::Long(value) => write!(f, "{}", value),
            FieldValue::Short(value) => write!(f, "{}", value),
            FieldValue::Boolean(value) => write!(f, "{}", value),
            FieldValue::Object(content) => match content.borrow().handle() {
                Some(handle) => write!(f, "r0x{:x}", handle),
                None => write!(f, "{}", content.borrow()),
            },
        }
    }
}

impl fmt::Debug for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Debug for JavaValue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            JavaValue::List(items) => write!(f, "List({} items)", items.len()),
            JavaValue::Map(entries) => write!(f, "Map({} entries)", entries.len()),
            JavaValue::Set(items) => write!(f, "Set({} items)", items.len()),
            JavaValue::Primitive(value) => write!(f, "Primitive({})", value),
            JavaValue::Time(time) => write!(f, "Time({:?})", time),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tag::BASE_HANDLE;

    fn desc(name: &str, handle: Handle) -> ClassDescRef {
        Rc::new(RefCell::new(ClassDesc::normal(
            name.to_string(),
            1,
            handle,
            SC_SERIALIZABLE,
            Vec::new(),
        )))
    }

    #[test]
    fn hierarchy_is_super_first() {
        let base = desc("Base", BASE_HANDLE);
        let derived = desc("Derived", BASE_HANDLE + 1);
        derived.borrow_mut().super_class = Some(base.clone());

        let chain = ClassDesc::hierarchy(&derived);
        assert_eq!(chain.len(), 2);
        assert_eq!(chain[0].borrow().name, "Base");
        assert_eq!(chain[1].borrow().name, "Derived");
    }

    #[test]
    fn hierarchy_stops_on_cycle() {
        let first = desc("First", BASE_HANDLE);
        let second = desc("Second", BASE_HANDLE + 1);
        first.borrow_mut().super_class = Some(second.clone());
        second.borrow_mut().super_class = Some(first.clone());

        let chain = ClassDesc::hierarchy(&first);
        assert_eq!(chain.len(), 2);
    }

    #[test]
    fn enum_validation_requires_recorded_constant() {
        let class_desc = desc("Color", BASE_HANDLE);
        let constant = Content::Str(JavaString {
            handle: BASE_HANDLE + 2,
            value: "RED".to_string(),
        })
        .into_ref();

        let value = JavaEnum {
            handle: BASE_HANDLE + 1,
            class_desc: class_desc.clone(),
            constant,
        };
        assert!(value.validate().is_err());

        class_desc.borrow_mut().enum_constants.insert("RED".to_string());
        assert!(value.validate().is_ok());
    }

    #[test]
    fn instance_validation_checks_field_coverage() {
        let class_desc = desc("X", BASE_HANDLE);
        class_desc.borrow_mut().fields.push(JavaField {
            field_type: FieldType::Integer,
            name: "count".to_string(),
            class_name: None,
        });

        let mut instance = Instance::new(BASE_HANDLE + 1, class_desc.clone());
        let mut values = IndexMap::new();
        values.insert("count".to_string(), FieldValue::Int(3));
        instance.field_data.insert(BASE_HANDLE, values);
        assert!(instance.validate().is_ok());

        instance
            .field_data
            .get_mut(&BASE_HANDLE)
            .unwrap()
            .insert("extra".to_string(), FieldValue::Int(4));
        assert!(instance.validate().is_err());
    }

    #[test]
    fn display_is_shallow_on_cycles() {
        let class_desc = desc("Node", BASE_HANDLE);
        let instance = Content::Instance(Instance::new(BASE_HANDLE + 1, class_desc)).into_ref();
        let cyclic = FieldValue::Object(instance.clone());
        if let Content::Instance(inner) = &mut *instance.borrow_mut() {
            let mut values = IndexMap::new();
            values.insert("next".to_string(), cyclic);
            inner.field_data.insert(BASE_HANDLE, values);
        }
        // Formatting must terminate even though the graph is cyclic.
        let rendered = format!("{}", instance.borrow());
        assert!(rendered.contains("Node"));
    }
}
