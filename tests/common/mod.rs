//! Synthetic HPROF encoder for end-to-end tests: builds byte-exact dumps
//! with a chosen identifier width, heap dump framing, and record mix.

#![allow(dead_code)]

pub const TAG_UTF8: u8 = 0x01;
pub const TAG_LOAD_CLASS: u8 = 0x02;
pub const TAG_STACK_FRAME: u8 = 0x04;
pub const TAG_STACK_TRACE: u8 = 0x05;
pub const TAG_START_THREAD: u8 = 0x0A;
pub const TAG_HEAP_DUMP: u8 = 0x0C;
pub const TAG_HEAP_DUMP_SEGMENT: u8 = 0x1C;
pub const TAG_HEAP_DUMP_END: u8 = 0x2C;

pub const SUB_ROOT_JNI_GLOBAL: u8 = 0x01;
pub const SUB_ROOT_JNI_LOCAL: u8 = 0x02;
pub const SUB_ROOT_JAVA_FRAME: u8 = 0x03;
pub const SUB_ROOT_STICKY_CLASS: u8 = 0x05;
pub const SUB_ROOT_MONITOR_USED: u8 = 0x07;
pub const SUB_ROOT_THREAD_OBJ: u8 = 0x08;
pub const SUB_CLASS_DUMP: u8 = 0x20;
pub const SUB_INSTANCE_DUMP: u8 = 0x21;
pub const SUB_OBJECT_ARRAY_DUMP: u8 = 0x22;
pub const SUB_PRIMITIVE_ARRAY_DUMP: u8 = 0x23;

pub const TYPE_OBJECT: u8 = 0x02;
pub const TYPE_BOOLEAN: u8 = 0x04;
pub const TYPE_CHAR: u8 = 0x05;
pub const TYPE_FLOAT: u8 = 0x06;
pub const TYPE_DOUBLE: u8 = 0x07;
pub const TYPE_BYTE: u8 = 0x08;
pub const TYPE_SHORT: u8 = 0x09;
pub const TYPE_INT: u8 = 0x0A;
pub const TYPE_LONG: u8 = 0x0B;

/// One static field of a class dump: name id, type, raw value.
pub struct StaticField {
    pub name_id: u64,
    pub type_code: u8,
    pub value: u64,
}

/// One declared instance field: name id, type.
pub struct InstanceField {
    pub name_id: u64,
    pub type_code: u8,
}

pub struct DumpBuilder {
    id_size: usize,
    bytes: Vec<u8>,
    /// Pending heap dump sub-records, flushed as one frame or as segments.
    heap: Vec<Vec<u8>>,
}

impl DumpBuilder {
    pub fn new(id_size: usize) -> DumpBuilder {
        assert!(id_size == 4 || id_size == 8);
        let mut bytes = Vec::new();
        bytes.extend_from_slice(b"JAVA PROFILE 1.0.2\0");
        bytes.extend_from_slice(&(id_size as u32).to_be_bytes());
        bytes.extend_from_slice(&1_600_000_000_000_u64.to_be_bytes());
        DumpBuilder {
            id_size,
            bytes,
            heap: Vec::new(),
        }
    }

    fn push_id(&self, out: &mut Vec<u8>, id: u64) {
        match self.id_size {
            4 => out.extend_from_slice(&(id as u32).to_be_bytes()),
            8 => out.extend_from_slice(&id.to_be_bytes()),
            _ => unreachable!(),
        }
    }

    fn record(&mut self, tag: u8, payload: &[u8]) {
        self.bytes.push(tag);
        self.bytes.extend_from_slice(&0_u32.to_be_bytes());
        self.bytes
            .extend_from_slice(&(payload.len() as u32).to_be_bytes());
        self.bytes.extend_from_slice(payload);
    }

    pub fn utf8(&mut self, name_id: u64, text: &[u8]) -> &mut Self {
        let mut payload = Vec::new();
        self.push_id(&mut payload, name_id);
        payload.extend_from_slice(text);
        self.record(TAG_UTF8, &payload);
        self
    }

    pub fn load_class(&mut self, serial: u32, class_id: u64, name_id: u64) -> &mut Self {
        let mut payload = Vec::new();
        payload.extend_from_slice(&serial.to_be_bytes());
        self.push_id(&mut payload, class_id);
        payload.extend_from_slice(&0_u32.to_be_bytes());
        self.push_id(&mut payload, name_id);
        self.record(TAG_LOAD_CLASS, &payload);
        self
    }

    pub fn stack_frame(
        &mut self,
        frame_id: u64,
        method_name_id: u64,
        signature_id: u64,
        source_file_id: u64,
        class_serial: u32,
        line: i32,
    ) -> &mut Self {
        let mut payload = Vec::new();
        self.push_id(&mut payload, frame_id);
        self.push_id(&mut payload, method_name_id);
        self.push_id(&mut payload, signature_id);
        self.push_id(&mut payload, source_file_id);
        payload.extend_from_slice(&class_serial.to_be_bytes());
        payload.extend_from_slice(&line.to_be_bytes());
        self.record(TAG_STACK_FRAME, &payload);
        self
    }

    pub fn stack_trace(&mut self, serial: u32, thread_serial: u32, frame_ids: &[u64]) -> &mut Self {
        let mut payload = Vec::new();
        payload.extend_from_slice(&serial.to_be_bytes());
        payload.extend_from_slice(&thread_serial.to_be_bytes());
        payload.extend_from_slice(&(frame_ids.len() as u32).to_be_bytes());
        for &id in frame_ids {
            self.push_id(&mut payload, id);
        }
        self.record(TAG_STACK_TRACE, &payload);
        self
    }

    pub fn start_thread(
        &mut self,
        serial: u32,
        thread_obj_id: u64,
        trace_serial: u32,
        name_id: u64,
    ) -> &mut Self {
        let mut payload = Vec::new();
        payload.extend_from_slice(&serial.to_be_bytes());
        self.push_id(&mut payload, thread_obj_id);
        payload.extend_from_slice(&trace_serial.to_be_bytes());
        self.push_id(&mut payload, name_id);
        self.push_id(&mut payload, 0);
        self.push_id(&mut payload, 0);
        self.record(TAG_START_THREAD, &payload);
        self
    }

    /// An unrecognised top-level record the parser must skip by length.
    pub fn unknown_record(&mut self, tag: u8, payload: &[u8]) -> &mut Self {
        self.record(tag, payload);
        self
    }

    // ---- heap dump sub-records; buffered until a flush ----

    pub fn class(
        &mut self,
        class_id: u64,
        super_class_id: u64,
        instance_size: u32,
        statics: &[StaticField],
        fields: &[InstanceField],
    ) -> &mut Self {
        let mut sub = vec![SUB_CLASS_DUMP];
        self.push_id(&mut sub, class_id);
        sub.extend_from_slice(&0_u32.to_be_bytes()); // stack trace serial
        self.push_id(&mut sub, super_class_id);
        self.push_id(&mut sub, 0); // class loader
        self.push_id(&mut sub, 0); // signers
        self.push_id(&mut sub, 0); // protection domain
        self.push_id(&mut sub, 0); // reserved
        self.push_id(&mut sub, 0); // reserved
        sub.extend_from_slice(&instance_size.to_be_bytes());
        sub.extend_from_slice(&0_u16.to_be_bytes()); // constant pool
        sub.extend_from_slice(&(statics.len() as u16).to_be_bytes());
        for s in statics {
            self.push_id(&mut sub, s.name_id);
            sub.push(s.type_code);
            self.push_value(&mut sub, s.type_code, s.value);
        }
        sub.extend_from_slice(&(fields.len() as u16).to_be_bytes());
        for f in fields {
            self.push_id(&mut sub, f.name_id);
            sub.push(f.type_code);
        }
        self.heap.push(sub);
        self
    }

    fn push_value(&self, out: &mut Vec<u8>, type_code: u8, value: u64) {
        match type_code {
            TYPE_OBJECT => self.push_id(out, value),
            TYPE_BOOLEAN | TYPE_BYTE => out.push(value as u8),
            TYPE_CHAR | TYPE_SHORT => out.extend_from_slice(&(value as u16).to_be_bytes()),
            TYPE_FLOAT | TYPE_INT => out.extend_from_slice(&(value as u32).to_be_bytes()),
            TYPE_DOUBLE | TYPE_LONG => out.extend_from_slice(&value.to_be_bytes()),
            _ => panic!("bad type code {}", type_code),
        }
    }

    pub fn instance(&mut self, obj_id: u64, class_id: u64, values: &[u8]) -> &mut Self {
        let mut sub = vec![SUB_INSTANCE_DUMP];
        self.push_id(&mut sub, obj_id);
        sub.extend_from_slice(&0_u32.to_be_bytes());
        self.push_id(&mut sub, class_id);
        sub.extend_from_slice(&(values.len() as u32).to_be_bytes());
        sub.extend_from_slice(values);
        self.heap.push(sub);
        self
    }

    /// Instance whose field payload is a run of object ids.
    pub fn instance_with_refs(&mut self, obj_id: u64, class_id: u64, refs: &[u64]) -> &mut Self {
        let mut values = Vec::new();
        for &r in refs {
            self.push_id(&mut values, r);
        }
        let values = values;
        self.instance(obj_id, class_id, &values)
    }

    pub fn object_array(&mut self, obj_id: u64, class_id: u64, elements: &[u64]) -> &mut Self {
        let mut sub = vec![SUB_OBJECT_ARRAY_DUMP];
        self.push_id(&mut sub, obj_id);
        sub.extend_from_slice(&0_u32.to_be_bytes());
        sub.extend_from_slice(&(elements.len() as u32).to_be_bytes());
        self.push_id(&mut sub, class_id);
        for &e in elements {
            self.push_id(&mut sub, e);
        }
        self.heap.push(sub);
        self
    }

    pub fn primitive_array(&mut self, obj_id: u64, type_code: u8, contents: &[u8]) -> &mut Self {
        let element_size = match type_code {
            TYPE_BOOLEAN | TYPE_BYTE => 1,
            TYPE_CHAR | TYPE_SHORT => 2,
            TYPE_FLOAT | TYPE_INT => 4,
            TYPE_DOUBLE | TYPE_LONG => 8,
            _ => panic!("bad primitive type {}", type_code),
        };
        assert_eq!(0, contents.len() % element_size);
        let mut sub = vec![SUB_PRIMITIVE_ARRAY_DUMP];
        self.push_id(&mut sub, obj_id);
        sub.extend_from_slice(&0_u32.to_be_bytes());
        sub.extend_from_slice(&((contents.len() / element_size) as u32).to_be_bytes());
        sub.push(type_code);
        sub.extend_from_slice(contents);
        self.heap.push(sub);
        self
    }

    pub fn root_jni_global(&mut self, obj_id: u64) -> &mut Self {
        let mut sub = vec![SUB_ROOT_JNI_GLOBAL];
        self.push_id(&mut sub, obj_id);
        self.push_id(&mut sub, 0xDEAD); // jni ref id
        self.heap.push(sub);
        self
    }

    pub fn root_sticky_class(&mut self, obj_id: u64) -> &mut Self {
        let mut sub = vec![SUB_ROOT_STICKY_CLASS];
        self.push_id(&mut sub, obj_id);
        self.heap.push(sub);
        self
    }

    pub fn root_monitor_used(&mut self, obj_id: u64) -> &mut Self {
        let mut sub = vec![SUB_ROOT_MONITOR_USED];
        self.push_id(&mut sub, obj_id);
        self.heap.push(sub);
        self
    }

    pub fn root_thread_obj(&mut self, obj_id: u64, thread_serial: u32, trace_serial: u32) -> &mut Self {
        let mut sub = vec![SUB_ROOT_THREAD_OBJ];
        self.push_id(&mut sub, obj_id);
        sub.extend_from_slice(&thread_serial.to_be_bytes());
        sub.extend_from_slice(&trace_serial.to_be_bytes());
        self.heap.push(sub);
        self
    }

    pub fn root_java_frame(&mut self, obj_id: u64, thread_serial: u32, frame_number: u32) -> &mut Self {
        let mut sub = vec![SUB_ROOT_JAVA_FRAME];
        self.push_id(&mut sub, obj_id);
        sub.extend_from_slice(&thread_serial.to_be_bytes());
        sub.extend_from_slice(&frame_number.to_be_bytes());
        self.heap.push(sub);
        self
    }

    pub fn root_jni_local(&mut self, obj_id: u64, thread_serial: u32, frame_number: u32) -> &mut Self {
        let mut sub = vec![SUB_ROOT_JNI_LOCAL];
        self.push_id(&mut sub, obj_id);
        sub.extend_from_slice(&thread_serial.to_be_bytes());
        sub.extend_from_slice(&frame_number.to_be_bytes());
        self.heap.push(sub);
        self
    }

    fn take_heap_bytes(&mut self) -> Vec<u8> {
        let subs = std::mem::take(&mut self.heap);
        subs.concat()
    }

    /// Flush buffered sub-records as a single `HeapDump` frame.
    pub fn flush_heap_dump(&mut self) -> &mut Self {
        let payload = self.take_heap_bytes();
        self.record(TAG_HEAP_DUMP, &payload);
        self
    }

    /// Flush buffered sub-records as `segments` HeapDumpSegment frames
    /// split at sub-record boundaries, terminated by HeapDumpEnd.
    pub fn flush_heap_segments(&mut self, segments: usize) -> &mut Self {
        assert!(segments >= 1);
        let subs = std::mem::take(&mut self.heap);
        let per_segment = (subs.len() + segments - 1) / segments.max(1);
        for chunk in subs.chunks(per_segment.max(1)) {
            let payload = chunk.concat();
            self.record(TAG_HEAP_DUMP_SEGMENT, &payload);
        }
        self.record(TAG_HEAP_DUMP_END, &[]);
        self
    }

    /// Flush as a truncated trailing segment: declared length 0, raw
    /// sub-record bytes to EOF. Must be the last thing written.
    pub fn flush_heap_truncated(&mut self) -> &mut Self {
        let payload = self.take_heap_bytes();
        self.bytes.push(TAG_HEAP_DUMP_SEGMENT);
        self.bytes.extend_from_slice(&0_u32.to_be_bytes());
        self.bytes.extend_from_slice(&0_u32.to_be_bytes());
        self.bytes.extend_from_slice(&payload);
        self
    }

    pub fn finish(&mut self) -> Vec<u8> {
        assert!(self.heap.is_empty(), "unflushed heap sub-records");
        std::mem::take(&mut self.bytes)
    }

    /// Write the dump into `dir` and return its path.
    pub fn write_to(&mut self, dir: &std::path::Path, name: &str) -> std::path::PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, self.finish()).expect("write dump");
        path
    }
}
