//! The object-transformer mechanism: a registry mapping well-known Java
//! class names to instance carriers that distill parsed field data and
//! annotations into native values.

use crate::content::{ClassDesc, Content, ContentRef, Instance, JavaValue};
use crate::error::{ParseError, ParseResult};
use crate::parser::StreamParser;
use crate::tag::TC_ENDBLOCKDATA;
use crate::time::JavaTime;
use hashbrown::HashMap;
use lazy_static::lazy_static;

/// Produces a carrier for class descriptors it recognizes.
pub trait ObjectTransformer {
    fn create(&self, class_desc: &ClassDesc) -> Option<Box<dyn InstanceCarrier>>;
}

/// Hooks invoked while an instance is being decoded.
pub trait InstanceCarrier {
    /// Consumes externalizable block data. `Ok(false)` means the carrier
    /// cannot interpret the bytes, which aborts the parse.
    fn load_from_blockdata(&mut self, _parser: &mut StreamParser<'_>) -> ParseResult<bool> {
        Ok(false)
    }

    /// Post-processes the instance once its field data and annotations are
    /// in place, typically by attaching a `JavaValue`.
    fn load_from_instance(&mut self, _instance: &mut Instance) -> bool {
        true
    }
}

/// Carrier used when no transformer claims the class.
pub struct GenericCarrier;

impl InstanceCarrier for GenericCarrier {}

/// Ordered list of transformers; the first one claiming a descriptor wins.
pub struct TransformerRegistry {
    transformers: Vec<Box<dyn ObjectTransformer>>,
}

impl TransformerRegistry {
    pub fn new() -> TransformerRegistry {
        TransformerRegistry {
            transformers: Vec::new(),
        }
    }

    pub fn register(&mut self, transformer: Box<dyn ObjectTransformer>) {
        self.transformers.push(transformer);
    }

    pub fn create(&self, class_desc: &ClassDesc) -> Box<dyn InstanceCarrier> {
        for transformer in &self.transformers {
            if let Some(carrier) = transformer.create(class_desc) {
                return carrier;
            }
        }
        Box::new(GenericCarrier)
    }
}

impl Default for TransformerRegistry {
    fn default() -> TransformerRegistry {
        let mut registry = TransformerRegistry::new();
        registry.register(Box::new(DefaultObjectTransformer));
        registry
    }
}

#[derive(Copy, Clone)]
enum CarrierKind {
    List,
    Map,
    LinkedMap,
    Set,
    TreeSet,
    Primitive,
    Time,
}

lazy_static! {
    static ref HANDLED_CLASSES: HashMap<&'static str, CarrierKind> = {
        let mut table = HashMap::new();
        table.insert("java.util.ArrayList", CarrierKind::List);
        table.insert("java.util.LinkedList", CarrierKind::List);
        table.insert("java.util.HashMap", CarrierKind::Map);
        table.insert("java.util.TreeMap", CarrierKind::Map);
        table.insert("java.util.LinkedHashMap", CarrierKind::LinkedMap);
        table.insert("java.util.HashSet", CarrierKind::Set);
        table.insert("java.util.LinkedHashSet", CarrierKind::Set);
        table.insert("java.util.TreeSet", CarrierKind::TreeSet);
        table.insert("java.lang.Boolean", CarrierKind::Primitive);
        table.insert("java.lang.Integer", CarrierKind::Primitive);
        table.insert("java.lang.Long", CarrierKind::Primitive);
        table.insert("java.time.Ser", CarrierKind::Time);
        table
    };
}

const LIST_CLASSES: &[&str] = &["java.util.ArrayList", "java.util.LinkedList"];
const MAP_CLASSES: &[&str] = &["java.util.HashMap", "java.util.TreeMap"];
const SET_CLASSES: &[&str] = &["java.util.HashSet", "java.util.LinkedHashSet"];
const TREE_SET_CLASSES: &[&str] = &["java.util.TreeSet"];
const TIME_CLASSES: &[&str] = &["java.time.Ser"];

/// Recognizes the common standard-library collection, boxed primitive and
/// `java.time` classes.
pub struct DefaultObjectTransformer;

impl ObjectTransformer for DefaultObjectTransformer {
    fn create(&self, class_desc: &ClassDesc) -> Option<Box<dyn InstanceCarrier>> {
        let carrier: Box<dyn InstanceCarrier> = match HANDLED_CLASSES.get(class_desc.name.as_str())? {
            CarrierKind::List => Box::new(ListCarrier),
            CarrierKind::Map => Box::new(MapCarrier),
            CarrierKind::LinkedMap => Box::new(LinkedMapCarrier::new()),
            CarrierKind::Set => Box::new(SetCarrier {
                names: SET_CLASSES,
                skip: 1,
            }),
            CarrierKind::TreeSet => Box::new(SetCarrier {
                names: TREE_SET_CLASSES,
                skip: 2,
            }),
            CarrierKind::Primitive => Box::new(PrimitiveCarrier),
            CarrierKind::Time => Box::new(TimeCarrier),
        };
        Some(carrier)
    }
}

/// The annotation list written by the class named in `names`, if any.
fn class_annotations<'a>(instance: &'a Instance, names: &[&str]) -> Option<&'a [ContentRef]> {
    for class_desc in ClassDesc::hierarchy(&instance.class_desc) {
        let class_desc = class_desc.borrow();
        if names.contains(&class_desc.name.as_str()) {
            if let Some(annotations) = instance.annotations.get(&class_desc.handle) {
                return Some(annotations.as_slice());
            }
        }
    }
    None
}

/// `ArrayList`/`LinkedList`: the elements follow the capacity block data in
/// the write-method annotations.
struct ListCarrier;

impl InstanceCarrier for ListCarrier {
    fn load_from_instance(&mut self, instance: &mut Instance) -> bool {
        let items = match class_annotations(instance, LIST_CLASSES) {
            Some(annotations) if !annotations.is_empty() => annotations[1..].to_vec(),
            _ => return false,
        };
        instance.value = Some(JavaValue::List(items));
        true
    }
}

/// `HashMap`/`TreeMap`: annotation items after the header block data pair
/// up as key, value, key, value.
struct MapCarrier;

impl InstanceCarrier for MapCarrier {
    fn load_from_instance(&mut self, instance: &mut Instance) -> bool {
        let entries = match class_annotations(instance, MAP_CLASSES) {
            Some(annotations) if !annotations.is_empty() => pair_up(&annotations[1..]),
            _ => return false,
        };
        instance.value = Some(JavaValue::Map(entries));
        true
    }
}

fn pair_up(items: &[ContentRef]) -> Vec<(ContentRef, ContentRef)> {
    let mut entries = Vec::with_capacity(items.len() / 2);
    let mut iter = items.iter();
    while let (Some(key), Some(value)) = (iter.next(), iter.next()) {
        entries.push((key.clone(), value.clone()));
    }
    entries
}

/// `LinkedHashMap` writes its entries through a custom block-data layout
/// instead of annotations.
struct LinkedMapCarrier {
    entries: Vec<(ContentRef, ContentRef)>,
}

impl LinkedMapCarrier {
    fn new() -> LinkedMapCarrier {
        LinkedMapCarrier {
            entries: Vec::new(),
        }
    }
}

impl InstanceCarrier for LinkedMapCarrier {
    fn load_from_blockdata(&mut self, parser: &mut StreamParser<'_>) -> ParseResult<bool> {
        let _buckets = parser.reader().read_int()?;
        let size = parser.reader().read_int()?;

        for _ in 0..size {
            let key_tag = parser.reader().read_byte()?;
            let key = parser.read_content(key_tag, true)?;
            let value_tag = parser.reader().read_byte()?;
            let value = parser.read_content(value_tag, true)?;
            self.entries.push((key, value));
        }

        let end = parser.reader().read_byte()?;
        if end != TC_ENDBLOCKDATA {
            return Err(ParseError::UnexpectedTag(end));
        }
        // The write method terminates with a zero byte.
        let trailer = parser.reader().read_byte()?;
        if trailer != 0 {
            return Err(ParseError::UnexpectedTag(trailer));
        }
        Ok(true)
    }

    fn load_from_instance(&mut self, instance: &mut Instance) -> bool {
        instance.value = Some(JavaValue::Map(std::mem::replace(&mut self.entries, Vec::new())));
        true
    }
}

/// Sets: elements follow `skip` annotation items of size/comparator
/// headers.
struct SetCarrier {
    names: &'static [&'static str],
    skip: usize,
}

impl InstanceCarrier for SetCarrier {
    fn load_from_instance(&mut self, instance: &mut Instance) -> bool {
        let items = match class_annotations(instance, self.names) {
            Some(annotations) if annotations.len() >= self.skip => annotations[self.skip..].to_vec(),
            _ => return false,
        };
        instance.value = Some(JavaValue::Set(items));
        true
    }
}

/// Boxed `Boolean`/`Integer`/`Long`: the payload sits in the field named
/// `value` somewhere in the hierarchy.
struct PrimitiveCarrier;

impl InstanceCarrier for PrimitiveCarrier {
    fn load_from_instance(&mut self, instance: &mut Instance) -> bool {
        let mut found = None;
        for values in instance.field_data.values() {
            if let Some(value) = values.get("value") {
                found = Some(value.clone());
                break;
            }
        }
        match found {
            Some(value) => {
                instance.value = Some(JavaValue::Primitive(value));
                true
            }
            None => false,
        }
    }
}

/// `java.time.Ser`: the block-data flag carries no bytes of its own; the
/// payload arrives as the first externalizable annotation.
struct TimeCarrier;

impl InstanceCarrier for TimeCarrier {
    fn load_from_blockdata(&mut self, _parser: &mut StreamParser<'_>) -> ParseResult<bool> {
        Ok(true)
    }

    fn load_from_instance(&mut self, instance: &mut Instance) -> bool {
        let time = {
            let annotations = match class_annotations(instance, TIME_CLASSES) {
                Some(annotations) => annotations,
                None => return false,
            };
            let first = match annotations.first() {
                Some(first) => first,
                None => return false,
            };
            let data = match &*first.borrow() {
                Content::BlockData(data) => data.clone(),
                _ => return false,
            };
            match JavaTime::from_bytes(&data) {
                Ok(time) => time,
                Err(_) => return false,
            }
        };
        instance.value = Some(JavaValue::Time(time));
        true
    }
}
