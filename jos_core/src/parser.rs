//! The recursive-descent stream parser: one-byte tag dispatch over a
//! handle-table session, with transformer hooks for well-known classes.

use crate::content::{
    ClassDesc, ClassDescRef, Content, ContentRef, ExceptionState, FieldValue, Instance, JavaArray,
    JavaClass, JavaEnum, JavaField, JavaString,
};
use crate::error::{ParseError, ParseResult};
use crate::handles::HandleTable;
use crate::mutf8;
use crate::reader::{Source, StreamReader};
use crate::tag::*;
use crate::transform::{InstanceCarrier, TransformerRegistry};
use indexmap::IndexMap;
use slog::{debug, o, warn, Discard, Logger};
use std::cell::RefCell;
use std::rc::Rc;

pub struct StreamParser<'a> {
    reader: StreamReader<'a>,
    handles: HandleTable,
    transformers: TransformerRegistry,
    log: Logger,
}

impl<'a> StreamParser<'a> {
    pub fn new(src: &'a mut dyn Source, transformers: TransformerRegistry) -> StreamParser<'a> {
        StreamParser::with_logger(src, transformers, Logger::root(Discard, o!()))
    }

    pub fn with_logger(
        src: &'a mut dyn Source,
        transformers: TransformerRegistry,
        log: Logger,
    ) -> StreamParser<'a> {
        StreamParser {
            reader: StreamReader::new(src),
            handles: HandleTable::new(),
            transformers,
            log,
        }
    }

    /// The underlying primitive reader; carriers use it to consume
    /// externalizable block data.
    #[inline]
    pub fn reader(&mut self) -> &mut StreamReader<'a> {
        &mut self.reader
    }

    /// The live handle session, including archived snapshots.
    #[inline]
    pub fn handles(&self) -> &HandleTable {
        &self.handles
    }

    /// Parses the whole stream: header check, then tag-dispatched content
    /// until end of stream.
    pub fn run(&mut self) -> ParseResult<Vec<ContentRef>> {
        let magic = self.reader.read_ushort()?;
        if magic != STREAM_MAGIC {
            return Err(ParseError::InvalidMagic(magic));
        }
        let version = self.reader.read_ushort()?;
        if version != STREAM_VERSION {
            return Err(ParseError::InvalidVersion(version));
        }

        self.handles.reset();

        let mut contents = Vec::new();
        loop {
            let start = self.reader.position()?;
            let tag = match self.reader.read_tag_or_eof()? {
                Some(tag) => tag,
                None => break,
            };

            if tag == TC_RESET {
                debug!(self.log, "stream reset"; "offset" => start);
                self.handles.reset();
                continue;
            }

            debug!(self.log, "reading content"; "offset" => start, "tag" => tag);
            let content = self.read_content(tag, true)?;

            let exceptional = content.borrow().is_exception();
            let content = if exceptional {
                // Capture the raw window covering the whole frame, from the
                // tag byte to the end of the thrown instance.
                let end = self.reader.position()?;
                let raw = self.reader.read_window(start, end)?;
                Content::Exception(ExceptionState {
                    instance: content,
                    raw,
                })
                .into_ref()
            } else {
                content
            };
            contents.push(content);
        }

        for (_, content) in self.handles.contents() {
            content.borrow().validate()?;
        }
        self.handles.archive_live();

        Ok(contents)
    }

    /// Dispatches one content item by its tag byte.
    ///
    /// The internal `ExceptionRead` signal stops here: the carried content
    /// is returned as an ordinary value with its exception flag set.
    pub fn read_content(&mut self, tag: u8, block_data_allowed: bool) -> ParseResult<ContentRef> {
        if !block_data_allowed && (tag == TC_BLOCKDATA || tag == TC_BLOCKDATALONG) {
            return Err(ParseError::UnexpectedBlockData);
        }

        // No `?` in the dispatch arms: every error must reach the catch
        // below so the exception signal can be reified.
        let result = match tag {
            TC_OBJECT => self.do_object(),
            TC_CLASS => self.do_class(),
            TC_ARRAY => self.do_array(),
            TC_STRING | TC_LONGSTRING => self.read_new_string(tag),
            TC_ENUM => self.do_enum(),
            TC_CLASSDESC | TC_PROXYCLASSDESC => self.do_new_classdesc(tag),
            TC_REFERENCE => self.do_reference(),
            TC_NULL => Ok(Content::Null.into_ref()),
            TC_EXCEPTION => self.do_exception(),
            TC_BLOCKDATA | TC_BLOCKDATALONG => self.do_block_data(tag),
            other => Err(ParseError::UnknownTag(other)),
        };

        match result {
            Err(ParseError::ExceptionRead(content)) => Ok(content),
            other => other,
        }
    }

    /// Reads a string body for TC_STRING / TC_LONGSTRING, or resolves a
    /// back-reference that must point at a string.
    fn read_new_string(&mut self, tag: u8) -> ParseResult<ContentRef> {
        match tag {
            TC_REFERENCE => {
                let previous = self.do_reference()?;
                let is_string = matches!(&*previous.borrow(), Content::Str(_));
                if !is_string {
                    return Err(ParseError::ReferenceTypeMismatch("string"));
                }
                return Ok(previous);
            }
            TC_STRING | TC_LONGSTRING => {}
            other => return Err(ParseError::UnexpectedTag(other)),
        }

        let handle = self.handles.reserve();
        let length = if tag == TC_STRING {
            i64::from(self.reader.read_ushort()?)
        } else {
            let length = self.reader.read_long()?;
            if length < 0 || length > i64::from(i32::max_value()) {
                return Err(ParseError::InvalidStringLength(length));
            }
            if length < 65536 {
                warn!(self.log, "small string stored as a long one"; "length" => length);
            }
            length
        };

        let data = self.reader.read_bytes(length as usize)?;
        let value = mutf8::decode(&data)?;
        let content = Content::Str(JavaString { handle, value }).into_ref();
        self.handles.bind(handle, content.clone())?;
        Ok(content)
    }

    /// Reads the tag byte of a class descriptor and parses it.
    fn read_classdesc(&mut self) -> ParseResult<Option<ClassDescRef>> {
        let tag = self.reader.read_byte()?;
        self.do_classdesc(tag, false)
    }

    /// Top-level CLASSDESC / PROXYCLASSDESC content.
    fn do_new_classdesc(&mut self, tag: u8) -> ParseResult<ContentRef> {
        let class_desc = self.do_classdesc(tag, false)?;
        Ok(match class_desc {
            Some(class_desc) => Content::ClassDesc(class_desc).into_ref(),
            None => Content::Null.into_ref(),
        })
    }

    fn do_classdesc(&mut self, tag: u8, must_be_new: bool) -> ParseResult<Option<ClassDescRef>> {
        match tag {
            TC_CLASSDESC => {
                let name = self.reader.read_utf()?;
                let serial_version_uid = self.reader.read_long()?;
                let handle = self.handles.reserve();
                let flags = self.reader.read_byte()?;

                let field_count = self.reader.read_short()?;
                if field_count < 0 {
                    return Err(ParseError::InvalidFieldCount(i32::from(field_count)));
                }

                let mut fields = Vec::with_capacity(field_count as usize);
                for _ in 0..field_count {
                    let type_byte = self.reader.read_byte()?;
                    let field_type = FieldType::from_byte(type_byte)
                        .ok_or(ParseError::InvalidFieldType(type_byte))?;
                    let field_name = self.reader.read_utf()?;
                    let class_name = if field_type.is_primitive() {
                        None
                    } else {
                        let string_tag = self.reader.read_byte()?;
                        Some(self.read_new_string(string_tag)?)
                    };
                    fields.push(JavaField {
                        field_type,
                        name: field_name,
                        class_name,
                    });
                }

                let class_desc = Rc::new(RefCell::new(ClassDesc::normal(
                    name,
                    serial_version_uid,
                    handle,
                    flags,
                    fields,
                )));
                // Publish the shell before the nested reads; back-references
                // inside the annotations or the super chain resolve to it.
                self.handles
                    .bind(handle, Content::ClassDesc(class_desc.clone()).into_ref())?;

                let annotations = self.read_class_annotations()?;
                let super_class = self.read_classdesc()?;
                {
                    let mut cell = class_desc.borrow_mut();
                    cell.annotations = annotations;
                    cell.super_class = super_class;
                }
                Ok(Some(class_desc))
            }
            TC_PROXYCLASSDESC => {
                let handle = self.handles.reserve();
                let interface_count = self.reader.read_int()?;
                if interface_count < 0 {
                    return Err(ParseError::InvalidFieldCount(interface_count));
                }

                let mut interfaces = Vec::new();
                for _ in 0..interface_count {
                    interfaces.push(self.reader.read_utf()?);
                }

                let class_desc = Rc::new(RefCell::new(ClassDesc::proxy(handle, interfaces)));
                self.handles
                    .bind(handle, Content::ClassDesc(class_desc.clone()).into_ref())?;

                let annotations = self.read_class_annotations()?;
                let super_class = self.read_classdesc()?;
                {
                    let mut cell = class_desc.borrow_mut();
                    cell.annotations = annotations;
                    cell.super_class = super_class;
                }
                Ok(Some(class_desc))
            }
            TC_NULL => {
                if must_be_new {
                    return Err(ParseError::UnexpectedTag(TC_NULL));
                }
                Ok(None)
            }
            TC_REFERENCE => {
                if must_be_new {
                    return Err(ParseError::UnexpectedTag(TC_REFERENCE));
                }
                let previous = self.do_reference()?;
                let class_desc = match &*previous.borrow() {
                    Content::ClassDesc(class_desc) => class_desc.clone(),
                    _ => return Err(ParseError::ReferenceTypeMismatch("class descriptor")),
                };
                Ok(Some(class_desc))
            }
            other => Err(ParseError::UnexpectedTag(other)),
        }
    }

    /// Reads content until the end-of-block tag. A RESET clears the session
    /// and reading continues; a decoded exception re-raises.
    fn read_class_annotations(&mut self) -> ParseResult<Vec<ContentRef>> {
        let mut contents = Vec::new();
        loop {
            let tag = self.reader.read_byte()?;
            match tag {
                TC_ENDBLOCKDATA => return Ok(contents),
                TC_RESET => self.handles.reset(),
                _ => {
                    let content = self.read_content(tag, true)?;
                    if content.borrow().is_exception() {
                        return Err(ParseError::ExceptionRead(content));
                    }
                    contents.push(content);
                }
            }
        }
    }

    fn do_object(&mut self) -> ParseResult<ContentRef> {
        let class_desc = self
            .read_classdesc()?
            .ok_or(ParseError::UnexpectedTag(TC_NULL))?;

        let handle = self.handles.reserve();
        debug!(self.log, "reading new object";
               "handle" => handle, "class" => class_desc.borrow().name.clone());

        let mut carrier = self.transformers.create(&class_desc.borrow());
        let content = Content::Instance(Instance::new(handle, class_desc.clone())).into_ref();
        // Bound before the class data so the object can reference itself.
        self.handles.bind(handle, content.clone())?;

        self.read_class_data(&content, &class_desc, carrier.as_mut())?;
        Ok(content)
    }

    /// Reads the instance data for every ancestor, super-first, honoring
    /// the per-class flag discipline.
    fn read_class_data(
        &mut self,
        instance: &ContentRef,
        class_desc: &ClassDescRef,
        carrier: &mut dyn InstanceCarrier,
    ) -> ParseResult<()> {
        let hierarchy = ClassDesc::hierarchy(class_desc);

        let mut all_data = IndexMap::new();
        let mut annotations = IndexMap::new();

        for ancestor in &hierarchy {
            let (handle, flags, class_name, declared) = {
                let ancestor = ancestor.borrow();
                let declared: Vec<(FieldType, String)> = ancestor
                    .fields
                    .iter()
                    .map(|field| (field.field_type, field.name.clone()))
                    .collect();
                (ancestor.handle, ancestor.flags, ancestor.name.clone(), declared)
            };

            if flags & SC_SERIALIZABLE != 0 {
                if flags & SC_EXTERNALIZABLE != 0 {
                    return Err(ParseError::FlagConflict(flags));
                }

                let mut values = IndexMap::new();
                for (field_type, field_name) in declared {
                    let value = self.read_field_value(field_type)?;
                    values.insert(field_name, value);
                }
                all_data.insert(handle, values);

                if flags & SC_WRITE_METHOD != 0 {
                    if flags & SC_ENUM != 0 {
                        return Err(ParseError::FlagConflict(flags));
                    }
                    annotations.insert(handle, self.read_class_annotations()?);
                }
            } else if flags & SC_EXTERNALIZABLE != 0 {
                if flags & SC_BLOCK_DATA != 0 {
                    if !carrier.load_from_blockdata(self)? {
                        return Err(ParseError::CannotInterpretExternalizable(class_name));
                    }
                }
                annotations.insert(handle, self.read_class_annotations()?);
            }
        }

        let mut cell = instance.borrow_mut();
        if let Content::Instance(instance) = &mut *cell {
            instance.field_data = all_data;
            instance.annotations = annotations;
            carrier.load_from_instance(instance);
        }
        Ok(())
    }

    /// One typed field or array element.
    fn read_field_value(&mut self, field_type: FieldType) -> ParseResult<FieldValue> {
        Ok(match field_type {
            FieldType::Byte => FieldValue::Byte(self.reader.read_i8()?),
            FieldType::Char => FieldValue::Char(self.reader.read_char()?),
            FieldType::Double => FieldValue::Double(self.reader.read_double()?),
            FieldType::Float => FieldValue::Float(self.reader.read_float()?),
            FieldType::Integer => FieldValue::Int(self.reader.read_int()?),
            FieldType::Long => FieldValue::Long(self.reader.read_long()?),
            FieldType::Short => FieldValue::Short(self.reader.read_short()?),
            FieldType::Boolean => FieldValue::Boolean(self.reader.read_bool()?),
            FieldType::Object | FieldType::Array => {
                let tag = self.reader.read_byte()?;
                if field_type == FieldType::Array && tag != TC_ARRAY {
                    return Err(ParseError::UnexpectedTag(tag));
                }
                let content = self.read_content(tag, false)?;
                if content.borrow().is_exception() {
                    return Err(ParseError::ExceptionRead(content));
                }
                FieldValue::Object(content)
            }
        })
    }

    fn do_reference(&mut self) -> ParseResult<ContentRef> {
        let handle = self.reader.read_uint()?;
        self.handles.get(handle)
    }

    fn do_enum(&mut self) -> ParseResult<ContentRef> {
        let class_desc = self
            .read_classdesc()?
            .ok_or(ParseError::UnexpectedTag(TC_NULL))?;

        let handle = self.handles.reserve();

        // The constant string is read under its own handle.
        let string_tag = self.reader.read_byte()?;
        let constant = self.read_new_string(string_tag)?;
        if let Content::Str(string) = &*constant.borrow() {
            class_desc
                .borrow_mut()
                .enum_constants
                .insert(string.value.clone());
        }

        // The reserved handle binds the enum object itself.
        let content = Content::Enum(JavaEnum {
            handle,
            class_desc,
            constant: constant.clone(),
        })
        .into_ref();
        self.handles.bind(handle, content.clone())?;
        Ok(content)
    }

    fn do_class(&mut self) -> ParseResult<ContentRef> {
        let class_desc = self.read_classdesc()?;
        let handle = self.handles.reserve();
        let content = Content::Class(JavaClass { handle, class_desc }).into_ref();
        self.handles.bind(handle, content.clone())?;
        Ok(content)
    }

    fn do_array(&mut self) -> ParseResult<ContentRef> {
        let class_desc = self
            .read_classdesc()?
            .ok_or(ParseError::UnexpectedTag(TC_NULL))?;

        let handle = self.handles.reserve();

        // The element type is the second character of the JVM signature the
        // array class is named after.
        let element_byte = {
            let class_desc = class_desc.borrow();
            let bytes = class_desc.name.as_bytes();
            if bytes.len() < 2 {
                return Err(ParseError::InvalidArrayName(class_desc.name.clone()));
            }
            bytes[1]
        };
        let field_type =
            FieldType::from_byte(element_byte).ok_or(ParseError::InvalidFieldType(element_byte))?;

        let size = self.reader.read_int()?;
        if size < 0 {
            return Err(ParseError::InvalidArraySize(size));
        }

        let content = Content::Array(JavaArray {
            handle,
            class_desc,
            field_type,
            values: Vec::new(),
        })
        .into_ref();
        // Bound before the element reads so self-referential arrays resolve.
        self.handles.bind(handle, content.clone())?;

        for _ in 0..size {
            let value = self.read_field_value(field_type)?;
            if let Content::Array(array) = &mut *content.borrow_mut() {
                array.values.push(value);
            }
        }
        Ok(content)
    }

    /// An exception frame: the session resets on both sides of the thrown
    /// instance, and the caller wraps the result with its raw bytes.
    fn do_exception(&mut self) -> ParseResult<ContentRef> {
        self.handles.reset();

        let tag = self.reader.read_byte()?;
        if tag == TC_RESET {
            return Err(ParseError::UnexpectedTag(TC_RESET));
        }

        let content = self.read_content(tag, false)?;
        let already_exceptional = content.borrow().is_exception();
        if already_exceptional {
            return Err(ParseError::ExceptionRead(content));
        }
        {
            let mut cell = content.borrow_mut();
            match &mut *cell {
                Content::Instance(instance) => instance.is_exception = true,
                _ => return Err(ParseError::ReferenceTypeMismatch("instance")),
            }
        }

        self.handles.reset();
        Ok(content)
    }

    fn do_block_data(&mut self, tag: u8) -> ParseResult<ContentRef> {
        let size = match tag {
            TC_BLOCKDATA => i64::from(self.reader.read_byte()?),
            TC_BLOCKDATALONG => {
                let size = self.reader.read_int()?;
                if size < 0 {
                    return Err(ParseError::InvalidBlockDataSize(size));
                }
                i64::from(size)
            }
            other => return Err(ParseError::UnexpectedTag(other)),
        };
        let data = self.reader.read_bytes(size as usize)?;
        Ok(Content::BlockData(data).into_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::JavaValue;
    use std::io::Cursor;

    fn stream(body: &[u8]) -> Vec<u8> {
        let mut data = vec![0xAC, 0xED, 0x00, 0x05];
        data.extend_from_slice(body);
        data
    }

    fn parse(data: Vec<u8>) -> ParseResult<Vec<ContentRef>> {
        let mut src = Cursor::new(data);
        let mut parser = StreamParser::new(&mut src, TransformerRegistry::default());
        parser.run()
    }

    fn utf(text: &str) -> Vec<u8> {
        let mut out = (text.len() as u16).to_be_bytes().to_vec();
        out.extend_from_slice(text.as_bytes());
        out
    }

    /// A TC_STRING with its body.
    fn string(text: &str) -> Vec<u8> {
        let mut out = vec![TC_STRING];
        out.extend(utf(text));
        out
    }

    /// A full TC_CLASSDESC with empty annotations and a null super class.
    /// Object/array fields carry their signature as a new string.
    fn classdesc(name: &str, flags: u8, fields: &[(u8, &str, Option<&str>)]) -> Vec<u8> {
        let mut out = vec![TC_CLASSDESC];
        out.extend(utf(name));
        out.extend_from_slice(&[0, 0, 0, 0, 0, 0, 0, 1]); // serialVersionUID
        out.push(flags);
        out.extend_from_slice(&(fields.len() as u16).to_be_bytes());
        for (type_byte, field_name, signature) in fields {
            out.push(*type_byte);
            out.extend(utf(field_name));
            if let Some(signature) = signature {
                out.push(TC_STRING);
                out.extend(utf(signature));
            }
        }
        out.push(TC_ENDBLOCKDATA);
        out.push(TC_NULL);
        out
    }

    fn reference(handle: u32) -> Vec<u8> {
        let mut out = vec![TC_REFERENCE];
        out.extend_from_slice(&handle.to_be_bytes());
        out
    }

    fn as_string(content: &ContentRef) -> String {
        match &*content.borrow() {
            Content::Str(string) => string.value.clone(),
            other => panic!("not a string: {}", other),
        }
    }

    #[test]
    fn header_only_is_empty() {
        assert!(parse(stream(&[])).unwrap().is_empty());
    }

    #[test]
    fn invalid_magic() {
        assert!(matches!(
            parse(vec![0xCA, 0xFE, 0x00, 0x05]),
            Err(ParseError::InvalidMagic(0xCAFE))
        ));
    }

    #[test]
    fn invalid_version() {
        assert!(matches!(
            parse(vec![0xAC, 0xED, 0x00, 0x04]),
            Err(ParseError::InvalidVersion(4))
        ));
    }

    #[test]
    fn null_only() {
        let contents = parse(stream(&[TC_NULL])).unwrap();
        assert_eq!(contents.len(), 1);
        assert!(matches!(&*contents[0].borrow(), Content::Null));
    }

    #[test]
    fn short_string() {
        let data = stream(&string("hello"));
        let mut src = Cursor::new(data);
        let mut parser = StreamParser::new(&mut src, TransformerRegistry::default());
        let contents = parser.run().unwrap();

        assert_eq!(contents.len(), 1);
        match &*contents[0].borrow() {
            Content::Str(string) => {
                assert_eq!(string.handle, BASE_HANDLE);
                assert_eq!(string.value, "hello");
            }
            other => panic!("not a string: {}", other),
        }
        assert_eq!(parser.handles().len(), 1);
    }

    #[test]
    fn long_string_is_accepted() {
        let mut body = vec![TC_LONGSTRING];
        body.extend_from_slice(&5u64.to_be_bytes());
        body.extend_from_slice(b"hello");

        let contents = parse(stream(&body)).unwrap();
        assert_eq!(as_string(&contents[0]), "hello");
    }

    #[test]
    fn negative_long_string_is_rejected() {
        let mut body = vec![TC_LONGSTRING];
        body.extend_from_slice(&(-1i64).to_be_bytes());

        assert!(matches!(
            parse(stream(&body)),
            Err(ParseError::InvalidStringLength(-1))
        ));
    }

    #[test]
    fn string_back_reference_shares_the_slot() {
        let mut body = string("A");
        body.extend(reference(BASE_HANDLE));

        let contents = parse(stream(&body)).unwrap();
        assert_eq!(contents.len(), 2);
        assert!(Rc::ptr_eq(&contents[0], &contents[1]));
        assert_eq!(as_string(&contents[1]), "A");
    }

    #[test]
    fn reference_to_unknown_handle() {
        let body = reference(BASE_HANDLE + 5);
        assert!(matches!(
            parse(stream(&body)),
            Err(ParseError::UnknownHandle(_))
        ));
    }

    #[test]
    fn reset_rewinds_the_handle_counter() {
        let mut body = string("A");
        body.push(TC_RESET);
        body.extend(string("B"));

        let mut src = Cursor::new(stream(&body));
        let mut parser = StreamParser::new(&mut src, TransformerRegistry::default());
        let contents = parser.run().unwrap();

        assert_eq!(contents.len(), 2);
        match &*contents[1].borrow() {
            Content::Str(string) => {
                assert_eq!(string.handle, BASE_HANDLE);
                assert_eq!(string.value, "B");
            }
            other => panic!("not a string: {}", other),
        }
        // One snapshot from the reset, one from the end of the run.
        assert_eq!(parser.handles().archive().len(), 2);
    }

    #[test]
    fn empty_serializable_instance() {
        let mut body = vec![TC_OBJECT];
        body.extend(classdesc("X", SC_SERIALIZABLE, &[]));

        let contents = parse(stream(&body)).unwrap();
        match &*contents[0].borrow() {
            Content::Instance(instance) => {
                assert_eq!(instance.handle, BASE_HANDLE + 1);
                assert_eq!(instance.class_name(), "X");
                assert_eq!(instance.field_data.len(), 1);
                assert!(instance.field_data[&BASE_HANDLE].is_empty());
                assert!(instance.annotations.is_empty());
                assert!(!instance.is_exception);
            }
            other => panic!("not an instance: {}", other),
        };
    }

    #[test]
    fn instance_field_values() {
        let mut body = vec![TC_OBJECT];
        body.extend(classdesc(
            "Point",
            SC_SERIALIZABLE,
            &[(b'I', "x", None), (b'J', "y", None), (b'Z', "seen", None)],
        ));
        body.extend_from_slice(&3i32.to_be_bytes());
        body.extend_from_slice(&(-9i64).to_be_bytes());
        body.push(1);

        let contents = parse(stream(&body)).unwrap();
        match &*contents[0].borrow() {
            Content::Instance(instance) => {
                let values = &instance.field_data[&BASE_HANDLE];
                assert!(matches!(values["x"], FieldValue::Int(3)));
                assert!(matches!(values["y"], FieldValue::Long(-9)));
                assert!(matches!(values["seen"], FieldValue::Boolean(true)));
            }
            other => panic!("not an instance: {}", other),
        };
    }

    #[test]
    fn instance_can_reference_itself() {
        let mut body = vec![TC_OBJECT];
        body.extend(classdesc(
            "Node",
            SC_SERIALIZABLE,
            &[(b'L', "next", Some("LNode;"))],
        ));
        // Descriptor gets 0x7e0000, the signature string 0x7e0001, the
        // instance itself 0x7e0002.
        body.extend(reference(BASE_HANDLE + 2));

        let contents = parse(stream(&body)).unwrap();
        match &*contents[0].borrow() {
            Content::Instance(instance) => {
                assert_eq!(instance.handle, BASE_HANDLE + 2);
                match &instance.field_data[&BASE_HANDLE]["next"] {
                    FieldValue::Object(inner) => assert!(Rc::ptr_eq(inner, &contents[0])),
                    other => panic!("not an object: {}", other),
                }
            }
            other => panic!("not an instance: {}", other),
        };
    }

    #[test]
    fn super_chain_is_read_super_first() {
        // Derived(b) extends Base(a); the wire carries Base's field first.
        let mut body = vec![TC_OBJECT, TC_CLASSDESC];
        body.extend(utf("Derived"));
        body.extend_from_slice(&[0, 0, 0, 0, 0, 0, 0, 2]);
        body.push(SC_SERIALIZABLE);
        body.extend_from_slice(&1u16.to_be_bytes());
        body.push(b'I');
        body.extend(utf("b"));
        body.push(TC_ENDBLOCKDATA);
        body.extend(classdesc("Base", SC_SERIALIZABLE, &[(b'I', "a", None)]));
        body.extend_from_slice(&1i32.to_be_bytes()); // Base.a
        body.extend_from_slice(&2i32.to_be_bytes()); // Derived.b

        let contents = parse(stream(&body)).unwrap();
        match &*contents[0].borrow() {
            Content::Instance(instance) => {
                let mut iter = instance.field_data.iter();
                let (_, base_values) = iter.next().unwrap();
                let (_, derived_values) = iter.next().unwrap();
                assert!(matches!(base_values["a"], FieldValue::Int(1)));
                assert!(matches!(derived_values["b"], FieldValue::Int(2)));
            }
            other => panic!("not an instance: {}", other),
        };
    }

    #[test]
    fn serializable_and_externalizable_conflict() {
        let mut body = vec![TC_OBJECT];
        body.extend(classdesc("Bad", SC_SERIALIZABLE | SC_EXTERNALIZABLE, &[]));
        assert!(matches!(
            parse(stream(&body)),
            Err(ParseError::FlagConflict(_))
        ));
    }

    #[test]
    fn enum_and_write_method_conflict() {
        let mut body = vec![TC_OBJECT];
        body.extend(classdesc(
            "Bad",
            SC_SERIALIZABLE | SC_WRITE_METHOD | SC_ENUM,
            &[],
        ));
        assert!(matches!(
            parse(stream(&body)),
            Err(ParseError::FlagConflict(_))
        ));
    }

    #[test]
    fn negative_field_count_is_rejected() {
        let mut body = vec![TC_CLASSDESC];
        body.extend(utf("X"));
        body.extend_from_slice(&[0, 0, 0, 0, 0, 0, 0, 1]);
        body.push(SC_SERIALIZABLE);
        body.extend_from_slice(&(-1i16).to_be_bytes());

        assert!(matches!(
            parse(stream(&body)),
            Err(ParseError::InvalidFieldCount(-1))
        ));
    }

    #[test]
    fn invalid_field_type_is_rejected() {
        let mut body = vec![TC_CLASSDESC];
        body.extend(utf("X"));
        body.extend_from_slice(&[0, 0, 0, 0, 0, 0, 0, 1]);
        body.push(SC_SERIALIZABLE);
        body.extend_from_slice(&1u16.to_be_bytes());
        body.push(b'Q');
        body.extend(utf("field"));

        assert!(matches!(
            parse(stream(&body)),
            Err(ParseError::InvalidFieldType(0x51))
        ));
    }

    #[test]
    fn descriptor_reference_must_be_a_descriptor() {
        let mut body = string("A");
        body.push(TC_OBJECT);
        body.extend(reference(BASE_HANDLE));

        assert!(matches!(
            parse(stream(&body)),
            Err(ParseError::ReferenceTypeMismatch("class descriptor"))
        ));
    }

    #[test]
    fn descriptor_annotations_can_reference_the_descriptor() {
        let mut body = vec![TC_CLASSDESC];
        body.extend(utf("Weird"));
        body.extend_from_slice(&[0, 0, 0, 0, 0, 0, 0, 1]);
        body.push(SC_SERIALIZABLE);
        body.extend_from_slice(&0u16.to_be_bytes());
        body.extend(reference(BASE_HANDLE)); // annotation pointing back
        body.push(TC_ENDBLOCKDATA);
        body.push(TC_NULL);

        let contents = parse(stream(&body)).unwrap();
        match &*contents[0].borrow() {
            Content::ClassDesc(class_desc) => {
                let annotation = class_desc.borrow().annotations[0].clone();
                match &*annotation.borrow() {
                    Content::ClassDesc(inner) => assert!(Rc::ptr_eq(inner, class_desc)),
                    other => panic!("not a descriptor: {}", other),
                };
            }
            other => panic!("not a descriptor: {}", other),
        };
    }

    #[test]
    fn proxy_descriptor() {
        let mut body = vec![TC_PROXYCLASSDESC];
        body.extend_from_slice(&1i32.to_be_bytes());
        body.extend(utf("com.example.IFoo"));
        body.push(TC_ENDBLOCKDATA);
        body.push(TC_NULL);

        let contents = parse(stream(&body)).unwrap();
        match &*contents[0].borrow() {
            Content::ClassDesc(class_desc) => {
                let class_desc = class_desc.borrow();
                assert_eq!(class_desc.kind, crate::content::ClassDescKind::Proxy);
                assert_eq!(class_desc.handle, BASE_HANDLE);
                assert_eq!(class_desc.interfaces, vec!["com.example.IFoo".to_string()]);
            }
            other => panic!("not a descriptor: {}", other),
        };
    }

    #[test]
    fn class_object() {
        let mut body = vec![TC_CLASS];
        body.extend(classdesc("X", SC_SERIALIZABLE, &[]));

        let contents = parse(stream(&body)).unwrap();
        match &*contents[0].borrow() {
            Content::Class(class) => {
                assert_eq!(class.handle, BASE_HANDLE + 1);
                assert_eq!(class.class_desc.as_ref().unwrap().borrow().name, "X");
            }
            other => panic!("not a class: {}", other),
        };
    }

    #[test]
    fn primitive_array() {
        let mut body = vec![TC_ARRAY];
        body.extend(classdesc("[I", SC_SERIALIZABLE, &[]));
        body.extend_from_slice(&3i32.to_be_bytes());
        for value in &[1i32, 2, 3] {
            body.extend_from_slice(&value.to_be_bytes());
        }

        let contents = parse(stream(&body)).unwrap();
        match &*contents[0].borrow() {
            Content::Array(array) => {
                assert_eq!(array.handle, BASE_HANDLE + 1);
                assert_eq!(array.field_type, FieldType::Integer);
                assert_eq!(array.values.len(), 3);
                assert!(matches!(array.values[0], FieldValue::Int(1)));
                assert!(matches!(array.values[2], FieldValue::Int(3)));
            }
            other => panic!("not an array: {}", other),
        };
    }

    #[test]
    fn array_can_reference_itself() {
        let mut body = vec![TC_ARRAY];
        body.extend(classdesc("[Ljava.lang.Object;", SC_SERIALIZABLE, &[]));
        body.extend_from_slice(&1i32.to_be_bytes());
        body.extend(reference(BASE_HANDLE + 1));

        let contents = parse(stream(&body)).unwrap();
        match &*contents[0].borrow() {
            Content::Array(array) => match &array.values[0] {
                FieldValue::Object(inner) => assert!(Rc::ptr_eq(inner, &contents[0])),
                other => panic!("not an object: {}", other),
            },
            other => panic!("not an array: {}", other),
        };
    }

    #[test]
    fn negative_array_size_is_rejected() {
        let mut body = vec![TC_ARRAY];
        body.extend(classdesc("[I", SC_SERIALIZABLE, &[]));
        body.extend_from_slice(&(-1i32).to_be_bytes());

        assert!(matches!(
            parse(stream(&body)),
            Err(ParseError::InvalidArraySize(-1))
        ));
    }

    #[test]
    fn short_array_name_is_rejected() {
        let mut body = vec![TC_ARRAY];
        body.extend(classdesc("I", SC_SERIALIZABLE, &[]));
        assert!(matches!(
            parse(stream(&body)),
            Err(ParseError::InvalidArrayName(_))
        ));
    }

    #[test]
    fn array_typed_field_requires_array_tag() {
        let mut body = vec![TC_OBJECT];
        body.extend(classdesc(
            "Y",
            SC_SERIALIZABLE,
            &[(b'[', "arr", Some("[I"))],
        ));
        body.push(TC_NULL);

        assert!(matches!(
            parse(stream(&body)),
            Err(ParseError::UnexpectedTag(TC_NULL))
        ));
    }

    #[test]
    fn block_data_top_level() {
        let contents = parse(stream(&[TC_BLOCKDATA, 3, 1, 2, 3])).unwrap();
        match &*contents[0].borrow() {
            Content::BlockData(data) => assert_eq!(data, &vec![1, 2, 3]),
            other => panic!("not block data: {}", other),
        };
    }

    #[test]
    fn long_block_data() {
        let mut body = vec![TC_BLOCKDATALONG];
        body.extend_from_slice(&2i32.to_be_bytes());
        body.extend_from_slice(&[0xAB, 0xCD]);

        let contents = parse(stream(&body)).unwrap();
        match &*contents[0].borrow() {
            Content::BlockData(data) => assert_eq!(data, &vec![0xAB, 0xCD]),
            other => panic!("not block data: {}", other),
        };
    }

    #[test]
    fn negative_long_block_data_is_rejected() {
        let mut body = vec![TC_BLOCKDATALONG];
        body.extend_from_slice(&(-5i32).to_be_bytes());
        assert!(matches!(
            parse(stream(&body)),
            Err(ParseError::InvalidBlockDataSize(-5))
        ));
    }

    #[test]
    fn block_data_is_rejected_in_field_position() {
        let mut body = vec![TC_OBJECT];
        body.extend(classdesc(
            "X",
            SC_SERIALIZABLE,
            &[(b'L', "ref", Some("Ljava/lang/Object;"))],
        ));
        body.extend_from_slice(&[TC_BLOCKDATA, 1, 0]);

        assert!(matches!(
            parse(stream(&body)),
            Err(ParseError::UnexpectedBlockData)
        ));
    }

    #[test]
    fn unknown_tag_is_rejected() {
        assert!(matches!(
            parse(stream(&[0x50])),
            Err(ParseError::UnknownTag(0x50))
        ));
    }

    #[test]
    fn truncated_string_is_end_of_stream() {
        assert!(matches!(
            parse(stream(&[TC_STRING, 0x00])),
            Err(ParseError::UnexpectedEndOfStream)
        ));
    }

    #[test]
    fn enum_handle_binds_the_enum_object() {
        let mut body = vec![TC_ENUM];
        body.extend(classdesc("Color", SC_SERIALIZABLE | SC_ENUM, &[]));
        body.extend(string("RED"));
        // Descriptor 0x7e0000, enum 0x7e0001, constant string 0x7e0002.
        body.extend(reference(BASE_HANDLE + 1));

        let contents = parse(stream(&body)).unwrap();
        assert_eq!(contents.len(), 2);
        assert!(Rc::ptr_eq(&contents[0], &contents[1]));
        match &*contents[0].borrow() {
            Content::Enum(value) => {
                assert_eq!(value.handle, BASE_HANDLE + 1);
                assert_eq!(value.constant_name().as_deref(), Some("RED"));
                assert!(value.class_desc.borrow().enum_constants.contains("RED"));
            }
            other => panic!("not an enum: {}", other),
        };
    }

    #[test]
    fn exception_frame_captures_raw_bytes() {
        let mut body = vec![TC_EXCEPTION, TC_OBJECT];
        body.extend(classdesc("E", SC_SERIALIZABLE, &[]));

        let mut src = Cursor::new(stream(&body));
        let mut parser = StreamParser::new(&mut src, TransformerRegistry::default());
        let contents = parser.run().unwrap();

        assert_eq!(contents.len(), 1);
        match &*contents[0].borrow() {
            Content::Exception(state) => {
                assert_eq!(state.raw, body);
                match &*state.instance.borrow() {
                    Content::Instance(instance) => {
                        assert!(instance.is_exception);
                        assert_eq!(instance.class_name(), "E");
                    }
                    other => panic!("not an instance: {}", other),
                }
            }
            other => panic!("not an exception state: {}", other),
        }
        // The session is reset on both sides of the frame.
        assert!(parser.handles().is_empty());
    }

    #[test]
    fn exception_inside_annotations_unwinds_to_top_level() {
        let mut body = vec![TC_OBJECT];
        // Outer class writes annotations; the first one is a nested
        // exception frame.
        body.extend(classdesc(
            "Outer",
            SC_SERIALIZABLE | SC_WRITE_METHOD,
            &[],
        ));
        body.push(TC_EXCEPTION);
        body.push(TC_OBJECT);
        body.extend(classdesc("Err", SC_SERIALIZABLE, &[]));

        let contents = parse(stream(&body)).unwrap();
        assert_eq!(contents.len(), 1);
        match &*contents[0].borrow() {
            Content::Exception(state) => match &*state.instance.borrow() {
                Content::Instance(instance) => {
                    assert!(instance.is_exception);
                    assert_eq!(instance.class_name(), "Err");
                }
                other => panic!("not an instance: {}", other),
            },
            other => panic!("not an exception state: {}", other),
        };
    }

    #[test]
    fn reset_inside_exception_frame_is_rejected() {
        assert!(matches!(
            parse(stream(&[TC_EXCEPTION, TC_RESET])),
            Err(ParseError::UnexpectedTag(TC_RESET))
        ));
    }

    #[test]
    fn externalizable_without_a_carrier_aborts() {
        let mut body = vec![TC_OBJECT];
        body.extend(classdesc(
            "com.example.Ext",
            SC_EXTERNALIZABLE | SC_BLOCK_DATA,
            &[],
        ));

        assert!(matches!(
            parse(stream(&body)),
            Err(ParseError::CannotInterpretExternalizable(ref name)) if name == "com.example.Ext"
        ));
    }

    #[test]
    fn must_be_new_rejects_null_and_reference() {
        let mut src = Cursor::new(Vec::new());
        let mut parser = StreamParser::new(&mut src, TransformerRegistry::default());
        assert!(matches!(
            parser.do_classdesc(TC_NULL, true),
            Err(ParseError::UnexpectedTag(TC_NULL))
        ));
        assert!(matches!(
            parser.do_classdesc(TC_REFERENCE, true),
            Err(ParseError::UnexpectedTag(TC_REFERENCE))
        ));
    }

    #[test]
    fn array_list_distills_to_a_list() {
        let mut body = vec![TC_OBJECT];
        body.extend(classdesc(
            "java.util.ArrayList",
            SC_SERIALIZABLE | SC_WRITE_METHOD,
            &[(b'I', "size", None)],
        ));
        body.extend_from_slice(&3i32.to_be_bytes());
        // Write-method annotations: capacity block data, then the elements.
        body.extend_from_slice(&[TC_BLOCKDATA, 4, 0, 0, 0, 3]);
        body.extend(string("a"));
        body.extend(string("b"));
        body.extend(string("c"));
        body.push(TC_ENDBLOCKDATA);

        let contents = parse(stream(&body)).unwrap();
        match &*contents[0].borrow() {
            Content::Instance(instance) => match &instance.value {
                Some(JavaValue::List(items)) => {
                    let values: Vec<_> = items.iter().map(as_string).collect();
                    assert_eq!(values, vec!["a", "b", "c"]);
                }
                other => panic!("not a list: {:?}", other),
            },
            other => panic!("not an instance: {}", other),
        };
    }

    #[test]
    fn hash_map_distills_to_a_map() {
        let mut body = vec![TC_OBJECT];
        body.extend(classdesc(
            "java.util.HashMap",
            SC_SERIALIZABLE | SC_WRITE_METHOD,
            &[(b'F', "loadFactor", None), (b'I', "threshold", None)],
        ));
        body.extend_from_slice(&0.75f32.to_be_bytes());
        body.extend_from_slice(&12i32.to_be_bytes());
        // Buckets and size header, then alternating keys and values.
        body.extend_from_slice(&[TC_BLOCKDATA, 8, 0, 0, 0, 16, 0, 0, 0, 1]);
        body.extend(string("k"));
        body.extend(string("v"));
        body.push(TC_ENDBLOCKDATA);

        let contents = parse(stream(&body)).unwrap();
        match &*contents[0].borrow() {
            Content::Instance(instance) => match &instance.value {
                Some(JavaValue::Map(entries)) => {
                    assert_eq!(entries.len(), 1);
                    assert_eq!(as_string(&entries[0].0), "k");
                    assert_eq!(as_string(&entries[0].1), "v");
                }
                other => panic!("not a map: {:?}", other),
            },
            other => panic!("not an instance: {}", other),
        };
    }

    #[test]
    fn tree_set_skips_comparator_and_size() {
        let mut body = vec![TC_OBJECT];
        body.extend(classdesc(
            "java.util.TreeSet",
            SC_SERIALIZABLE | SC_WRITE_METHOD,
            &[],
        ));
        body.push(TC_NULL); // comparator
        body.extend_from_slice(&[TC_BLOCKDATA, 4, 0, 0, 0, 2]);
        body.extend(string("x"));
        body.extend(string("y"));
        body.push(TC_ENDBLOCKDATA);

        let contents = parse(stream(&body)).unwrap();
        match &*contents[0].borrow() {
            Content::Instance(instance) => match &instance.value {
                Some(JavaValue::Set(items)) => {
                    let values: Vec<_> = items.iter().map(as_string).collect();
                    assert_eq!(values, vec!["x", "y"]);
                }
                other => panic!("not a set: {:?}", other),
            },
            other => panic!("not an instance: {}", other),
        };
    }

    #[test]
    fn linked_hash_map_reads_custom_block_data() {
        let mut body = vec![TC_OBJECT];
        body.extend(classdesc(
            "java.util.LinkedHashMap",
            SC_EXTERNALIZABLE | SC_BLOCK_DATA,
            &[],
        ));
        body.extend_from_slice(&16i32.to_be_bytes()); // buckets
        body.extend_from_slice(&1i32.to_be_bytes()); // size
        body.extend(string("k"));
        body.extend(string("v"));
        body.push(TC_ENDBLOCKDATA);
        body.push(0x00);
        body.push(TC_ENDBLOCKDATA); // externalizable annotations

        let contents = parse(stream(&body)).unwrap();
        match &*contents[0].borrow() {
            Content::Instance(instance) => match &instance.value {
                Some(JavaValue::Map(entries)) => {
                    assert_eq!(entries.len(), 1);
                    assert_eq!(as_string(&entries[0].0), "k");
                    assert_eq!(as_string(&entries[0].1), "v");
                }
                other => panic!("not a map: {:?}", other),
            },
            other => panic!("not an instance: {}", other),
        };
    }

    #[test]
    fn boxed_integer_distills_to_a_primitive() {
        let mut body = vec![TC_OBJECT];
        body.extend(classdesc(
            "java.lang.Integer",
            SC_SERIALIZABLE,
            &[(b'I', "value", None)],
        ));
        body.extend_from_slice(&42i32.to_be_bytes());

        let contents = parse(stream(&body)).unwrap();
        match &*contents[0].borrow() {
            Content::Instance(instance) => assert!(matches!(
                instance.value,
                Some(JavaValue::Primitive(FieldValue::Int(42)))
            )),
            other => panic!("not an instance: {}", other),
        };
    }

    #[test]
    fn java_time_local_date() {
        let mut body = vec![TC_OBJECT];
        body.extend(classdesc(
            "java.time.Ser",
            SC_EXTERNALIZABLE | SC_BLOCK_DATA,
            &[],
        ));
        // The payload rides in the externalizable annotation block data.
        body.extend_from_slice(&[TC_BLOCKDATA, 7, 3]);
        body.extend_from_slice(&2020i32.to_be_bytes());
        body.push(6);
        body.push(15);
        body.push(TC_ENDBLOCKDATA);

        let contents = parse(stream(&body)).unwrap();
        match &*contents[0].borrow() {
            Content::Instance(instance) => match &instance.value {
                Some(JavaValue::Time(time)) => {
                    assert_eq!(time.kind, crate::time::TimeKind::LocalDate);
                    assert_eq!(time.year, Some(2020));
                    assert_eq!(time.month, Some(6));
                    assert_eq!(time.day, Some(15));
                }
                other => panic!("not a time: {:?}", other),
            },
            other => panic!("not an instance: {}", other),
        };
    }

    #[test]
    fn handle_range_is_contiguous() {
        let mut body = string("A");
        body.extend(string("B"));
        body.extend(string("C"));

        let mut src = Cursor::new(stream(&body));
        let mut parser = StreamParser::new(&mut src, TransformerRegistry::default());
        parser.run().unwrap();

        let handles: Vec<_> = parser
            .handles()
            .contents()
            .into_iter()
            .map(|(handle, _)| handle)
            .collect();
        assert_eq!(handles, vec![BASE_HANDLE, BASE_HANDLE + 1, BASE_HANDLE + 2]);
    }

    #[test]
    fn every_referenceable_value_is_indexed_under_its_own_handle() {
        let mut body = vec![TC_OBJECT];
        body.extend(classdesc(
            "Holder",
            SC_SERIALIZABLE,
            &[(b'L', "name", Some("Ljava/lang/String;"))],
        ));
        body.extend(string("payload"));

        let mut src = Cursor::new(stream(&body));
        let mut parser = StreamParser::new(&mut src, TransformerRegistry::default());
        parser.run().unwrap();

        for (handle, content) in parser.handles().contents() {
            assert_eq!(content.borrow().handle(), Some(handle));
        }
    }
}
