/// zlib-shaped stream and gzip file target
///
/// Streams and gz files are handles over a shared state table. Compression
/// uses stored (level 0) deflate blocks, which keeps the wire formats real
/// (zlib framing with Adler-32, gzip members with CRC-32 and ISIZE) without a
/// Huffman coder. Decoders accept stored blocks only and report anything else
/// as `Z_DATA_ERROR`.
///
/// File calls may block, so they are handed to the watchdog through
/// [`TargetLibrary::offload`].
use crate::core::library::{BlockingCall, NativeCall, TargetLibrary};
use crate::core::types::{HandleKind, NativeHandle, RawSignal, Value};
use log::{debug, warn};
use once_cell::sync::Lazy;
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

pub const LIBRARY_NAME: &str = "zlib";
pub const VERSION: &str = "1.3.1";

pub const Z_OK: i64 = 0;
pub const Z_STREAM_END: i64 = 1;
pub const Z_ERRNO: i64 = -1;
pub const Z_STREAM_ERROR: i64 = -2;
pub const Z_DATA_ERROR: i64 = -3;
pub const Z_BUF_ERROR: i64 = -5;

pub const Z_NO_FLUSH: i64 = 0;
pub const Z_FINISH: i64 = 4;

const KIND_DEFLATE: &str = "z.stream.deflate";
const KIND_INFLATE: &str = "z.stream.inflate";
const KIND_GZFILE: &str = "z.gzfile";

const BASE_ADDRESS: u64 = 0x7f00_0000;
const HANDLE_STRIDE: u64 = 0x100;
const MAX_STORED_BLOCK: usize = 0xffff;
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

static CRC_TABLE: Lazy<[u32; 256]> = Lazy::new(|| {
    let mut table = [0u32; 256];
    for (n, slot) in table.iter_mut().enumerate() {
        let mut c = n as u32;
        for _ in 0..8 {
            c = if c & 1 != 0 { 0xedb8_8320 ^ (c >> 1) } else { c >> 1 };
        }
        *slot = c;
    }
    table
});

/// CRC-32 (IEEE) continuing from `crc`
pub fn crc32(crc: u32, data: &[u8]) -> u32 {
    let mut c = !crc;
    for byte in data {
        c = CRC_TABLE[((c ^ *byte as u32) & 0xff) as usize] ^ (c >> 8);
    }
    !c
}

/// Adler-32 continuing from `adler` (start from 1)
pub fn adler32(adler: u32, data: &[u8]) -> u32 {
    const MOD: u32 = 65_521;
    let mut a = adler & 0xffff;
    let mut b = adler >> 16;
    for chunk in data.chunks(5552) {
        for byte in chunk {
            a += *byte as u32;
            b += a;
        }
        a %= MOD;
        b %= MOD;
    }
    (b << 16) | a
}

/// Raw deflate body made of stored blocks
fn stored_blocks(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + 5 * (data.len() / MAX_STORED_BLOCK + 1));
    let mut chunks = data.chunks(MAX_STORED_BLOCK).peekable();
    if chunks.peek().is_none() {
        out.extend_from_slice(&[0x01, 0x00, 0x00, 0xff, 0xff]);
        return out;
    }
    while let Some(chunk) = chunks.next() {
        let last = chunks.peek().is_none();
        let len = chunk.len() as u16;
        out.push(u8::from(last));
        out.extend_from_slice(&len.to_le_bytes());
        out.extend_from_slice(&(!len).to_le_bytes());
        out.extend_from_slice(chunk);
    }
    out
}

/// zlib stream: header, stored blocks, Adler-32 trailer
pub fn zlib_wrap(data: &[u8]) -> Vec<u8> {
    let mut out = vec![0x78, 0x01];
    out.extend(stored_blocks(data));
    out.extend_from_slice(&adler32(1, data).to_be_bytes());
    out
}

/// Worst-case compressed size for `len` input bytes
pub fn deflate_bound(len: usize) -> usize {
    let blocks = len.div_ceil(MAX_STORED_BLOCK).max(1);
    len + 5 * blocks + 6
}

#[derive(Debug, PartialEq)]
enum Decoded {
    Complete { data: Vec<u8>, consumed: usize },
    Incomplete,
    Corrupt(String),
}

/// Decode a raw deflate body of stored blocks.
fn read_stored_blocks(input: &[u8]) -> Decoded {
    let mut pos = 0;
    let mut data = Vec::new();
    loop {
        let header = match input.get(pos) {
            Some(byte) => *byte,
            None => return Decoded::Incomplete,
        };
        let btype = (header >> 1) & 0x03;
        if btype != 0 {
            return Decoded::Corrupt(format!(
                "block type {} at offset {} is not a stored block",
                btype, pos
            ));
        }
        if input.len() < pos + 5 {
            return Decoded::Incomplete;
        }
        let len = u16::from_le_bytes([input[pos + 1], input[pos + 2]]);
        let nlen = u16::from_le_bytes([input[pos + 3], input[pos + 4]]);
        if len != !nlen {
            return Decoded::Corrupt(format!("stored block length check failed at offset {}", pos));
        }
        let start = pos + 5;
        let end = start + len as usize;
        if input.len() < end {
            return Decoded::Incomplete;
        }
        data.extend_from_slice(&input[start..end]);
        pos = end;
        if header & 0x01 == 1 {
            return Decoded::Complete {
                data,
                consumed: pos,
            };
        }
    }
}

fn zlib_unwrap(input: &[u8]) -> Decoded {
    if input.len() < 2 {
        return Decoded::Incomplete;
    }
    let (cmf, flg) = (input[0], input[1]);
    if cmf & 0x0f != 8 || ((cmf as u16) << 8 | flg as u16) % 31 != 0 {
        return Decoded::Corrupt("incorrect header check".to_string());
    }
    if flg & 0x20 != 0 {
        return Decoded::Corrupt("preset dictionary not supported".to_string());
    }
    match read_stored_blocks(&input[2..]) {
        Decoded::Complete { data, consumed } => {
            let trailer = 2 + consumed;
            if input.len() < trailer + 4 {
                return Decoded::Incomplete;
            }
            let expected = u32::from_be_bytes([
                input[trailer],
                input[trailer + 1],
                input[trailer + 2],
                input[trailer + 3],
            ]);
            if adler32(1, &data) != expected {
                return Decoded::Corrupt("incorrect data check".to_string());
            }
            Decoded::Complete {
                data,
                consumed: trailer + 4,
            }
        }
        other => other,
    }
}

fn gzip_member(data: &[u8]) -> Vec<u8> {
    let mut out = vec![GZIP_MAGIC[0], GZIP_MAGIC[1], 8, 0, 0, 0, 0, 0, 0, 0xff];
    out.extend(stored_blocks(data));
    out.extend_from_slice(&crc32(0, data).to_le_bytes());
    out.extend_from_slice(&(data.len() as u32).to_le_bytes());
    out
}

fn gunzip(input: &[u8]) -> std::result::Result<Vec<u8>, String> {
    if input.is_empty() {
        return Ok(Vec::new());
    }
    if input.len() < 10 || input[..2] != GZIP_MAGIC || input[2] != 8 {
        return Err("not in gzip format".to_string());
    }
    let flags = input[3];
    let mut pos = 10;
    if flags & 0x04 != 0 {
        let xlen = input
            .get(pos..pos + 2)
            .map(|b| u16::from_le_bytes([b[0], b[1]]) as usize)
            .ok_or("truncated extra field")?;
        pos += 2 + xlen;
    }
    for bit in [0x08u8, 0x10] {
        if flags & bit != 0 {
            let nul = input
                .get(pos..)
                .and_then(|rest| rest.iter().position(|b| *b == 0))
                .ok_or("unterminated header string")?;
            pos += nul + 1;
        }
    }
    if flags & 0x02 != 0 {
        pos += 2;
    }
    let body = input.get(pos..).ok_or("truncated gzip header")?;
    match read_stored_blocks(body) {
        Decoded::Complete { data, consumed } => {
            let trailer = body
                .get(consumed..consumed + 8)
                .ok_or("truncated gzip trailer")?;
            let crc = u32::from_le_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
            let isize = u32::from_le_bytes([trailer[4], trailer[5], trailer[6], trailer[7]]);
            if crc != crc32(0, &data) {
                return Err("incorrect data check".to_string());
            }
            if isize != data.len() as u32 {
                return Err("incorrect length check".to_string());
            }
            Ok(data)
        }
        Decoded::Incomplete => Err("unexpected end of file".to_string()),
        Decoded::Corrupt(message) => Err(message),
    }
}

fn data_at(call: &NativeCall, idx: usize) -> Option<Vec<u8>> {
    call.bytes_at(idx)
        .map(|b| b.to_vec())
        .or_else(|| call.text_at(idx).map(|t| t.as_bytes().to_vec()))
}

#[derive(Debug)]
enum Mode {
    Deflate,
    Inflate,
}

#[derive(Debug)]
struct Stream {
    mode: Mode,
    input: Vec<u8>,
    output: Vec<u8>,
    finished: bool,
}

#[derive(Debug)]
enum GzState {
    Writing(Vec<u8>),
    Reading {
        raw: Vec<u8>,
        decoded: Option<Vec<u8>>,
        cursor: usize,
    },
}

#[derive(Debug)]
struct GzFile {
    path: PathBuf,
    state: GzState,
}

#[derive(Debug)]
enum Resource {
    Stream(Stream),
    File(GzFile),
}

/// Library-side allocation accounting
#[derive(Debug, Default, Clone)]
pub struct ZStats {
    pub opened: u64,
    pub closed: u64,
    /// Close calls that named a handle that is not open
    pub invalid_closes: u64,
}

impl ZStats {
    pub fn live(&self) -> u64 {
        self.opened.saturating_sub(self.closed)
    }
}

#[derive(Debug)]
struct ZState {
    resources: BTreeMap<u64, Resource>,
    next: u64,
    stats: ZStats,
}

impl ZState {
    fn open(&mut self, resource: Resource) -> u64 {
        let id = self.next;
        self.next += HANDLE_STRIDE;
        self.resources.insert(id, resource);
        self.stats.opened += 1;
        id
    }

    fn stream_mut(&mut self, handle: Option<NativeHandle>) -> Option<&mut Stream> {
        match self.resources.get_mut(&handle?.0) {
            Some(Resource::Stream(stream)) => Some(stream),
            _ => None,
        }
    }

    fn file_mut(&mut self, handle: Option<NativeHandle>) -> Option<&mut GzFile> {
        match self.resources.get_mut(&handle?.0) {
            Some(Resource::File(file)) => Some(file),
            _ => None,
        }
    }

    fn kind_of(&self, id: u64) -> Option<HandleKind> {
        let kind = match self.resources.get(&id)? {
            Resource::Stream(Stream {
                mode: Mode::Deflate,
                ..
            }) => KIND_DEFLATE,
            Resource::Stream(Stream {
                mode: Mode::Inflate,
                ..
            }) => KIND_INFLATE,
            Resource::File(_) => KIND_GZFILE,
        };
        Some(HandleKind::new(kind))
    }

    fn handle_signal(&self, id: u64) -> RawSignal {
        RawSignal::Handle {
            native: NativeHandle(id),
            kind: self.kind_of(id),
        }
    }

    fn init_stream(&mut self, mode: Mode, level: Option<i64>) -> RawSignal {
        if let Some(level) = level {
            if !(-1..=9).contains(&level) {
                return RawSignal::Code(Z_STREAM_ERROR);
            }
        }
        let id = self.open(Resource::Stream(Stream {
            mode,
            input: Vec::new(),
            output: Vec::new(),
            finished: false,
        }));
        self.handle_signal(id)
    }

    fn deflate(&mut self, call: &NativeCall) -> RawSignal {
        let data = data_at(call, 1).unwrap_or_default();
        let flush = call.int_at(2).unwrap_or(Z_NO_FLUSH);
        let stream = match self.stream_mut(call.handle_at(0)) {
            Some(stream @ Stream { mode: Mode::Deflate, .. }) => stream,
            _ => return RawSignal::Code(Z_STREAM_ERROR),
        };
        if stream.finished {
            return RawSignal::Code(Z_STREAM_ERROR);
        }
        stream.input.extend(data);
        if flush == Z_FINISH {
            stream.output = zlib_wrap(&stream.input);
            stream.finished = true;
            RawSignal::Code(Z_STREAM_END)
        } else {
            RawSignal::Code(Z_OK)
        }
    }

    fn inflate(&mut self, call: &NativeCall) -> RawSignal {
        let data = data_at(call, 1).unwrap_or_default();
        let flush = call.int_at(2).unwrap_or(Z_NO_FLUSH);
        let stream = match self.stream_mut(call.handle_at(0)) {
            Some(stream @ Stream { mode: Mode::Inflate, .. }) => stream,
            _ => return RawSignal::Code(Z_STREAM_ERROR),
        };
        if stream.finished {
            return RawSignal::Code(Z_STREAM_END);
        }
        stream.input.extend(data);
        match zlib_unwrap(&stream.input) {
            Decoded::Complete { data, .. } => {
                stream.output = data;
                stream.finished = true;
                RawSignal::Code(Z_STREAM_END)
            }
            Decoded::Incomplete if flush == Z_FINISH => RawSignal::Code(Z_BUF_ERROR),
            Decoded::Incomplete => RawSignal::Code(Z_OK),
            Decoded::Corrupt(message) => {
                debug!("inflate: {}", message);
                RawSignal::Code(Z_DATA_ERROR)
            }
        }
    }

    fn stream_output(&mut self, call: &NativeCall, mode: Mode) -> RawSignal {
        match self.stream_mut(call.handle_at(0)) {
            Some(stream) if std::mem::discriminant(&stream.mode) == std::mem::discriminant(&mode) => {
                RawSignal::Value(Value::Bytes(stream.output.clone()))
            }
            _ => RawSignal::Code(Z_STREAM_ERROR),
        }
    }

    fn end_stream(&mut self, call: &NativeCall, mode: Mode) -> RawSignal {
        let handle = match call.handle_at(0) {
            Some(handle) => handle,
            None => return RawSignal::Code(Z_STREAM_ERROR),
        };
        match self.resources.get(&handle.0) {
            Some(Resource::Stream(stream))
                if std::mem::discriminant(&stream.mode) == std::mem::discriminant(&mode) =>
            {
                self.resources.remove(&handle.0);
                self.stats.closed += 1;
                RawSignal::Code(Z_OK)
            }
            Some(_) => {
                warn!("{} called on a stream of the other family", call.function);
                RawSignal::Code(Z_STREAM_ERROR)
            }
            None => {
                self.stats.invalid_closes += 1;
                RawSignal::Code(Z_STREAM_ERROR)
            }
        }
    }

    fn gzopen(&mut self, call: &NativeCall) -> RawSignal {
        let (path, mode) = match (call.text_at(0), call.text_at(1)) {
            (Some(path), Some(mode)) => (PathBuf::from(path), mode),
            _ => return RawSignal::null(),
        };
        let state = if mode.starts_with('w') || mode.starts_with('a') {
            if let Err(e) = fs::write(&path, []) {
                debug!("gzopen {}: {}", path.display(), e);
                return RawSignal::null();
            }
            GzState::Writing(Vec::new())
        } else if mode.starts_with('r') {
            match fs::read(&path) {
                Ok(raw) => GzState::Reading {
                    raw,
                    decoded: None,
                    cursor: 0,
                },
                Err(e) => {
                    debug!("gzopen {}: {}", path.display(), e);
                    return RawSignal::null();
                }
            }
        } else {
            return RawSignal::null();
        };
        let id = self.open(Resource::File(GzFile { path, state }));
        self.handle_signal(id)
    }

    fn gzwrite(&mut self, call: &NativeCall) -> RawSignal {
        let data = data_at(call, 1).unwrap_or_default();
        match self.file_mut(call.handle_at(0)).map(|f| &mut f.state) {
            Some(GzState::Writing(buffer)) => {
                buffer.extend_from_slice(&data);
                RawSignal::Code(data.len() as i64)
            }
            _ => RawSignal::Code(Z_STREAM_ERROR),
        }
    }

    fn gzread(&mut self, call: &NativeCall) -> RawSignal {
        let wanted = call.int_at(1).unwrap_or(0).max(0) as usize;
        let (raw, decoded, cursor) = match self.file_mut(call.handle_at(0)).map(|f| &mut f.state) {
            Some(GzState::Reading {
                raw,
                decoded,
                cursor,
            }) => (raw, decoded, cursor),
            _ => return RawSignal::Code(Z_STREAM_ERROR),
        };
        if decoded.is_none() {
            match gunzip(raw) {
                Ok(data) => *decoded = Some(data),
                Err(message) => {
                    debug!("gzread: {}", message);
                    return RawSignal::Code(Z_DATA_ERROR);
                }
            }
        }
        let data = decoded.as_deref().unwrap_or_default();
        let end = (*cursor + wanted).min(data.len());
        let chunk = data[*cursor..end].to_vec();
        *cursor = end;
        RawSignal::Value(Value::Bytes(chunk))
    }

    fn gzclose(&mut self, call: &NativeCall) -> RawSignal {
        let handle = match call.handle_at(0) {
            Some(handle) => handle,
            None => return RawSignal::Code(Z_STREAM_ERROR),
        };
        let file = match self.resources.get(&handle.0) {
            Some(Resource::File(_)) => match self.resources.remove(&handle.0) {
                Some(Resource::File(file)) => file,
                _ => return RawSignal::Code(Z_STREAM_ERROR),
            },
            Some(Resource::Stream(_)) => return RawSignal::Code(Z_STREAM_ERROR),
            None => {
                self.stats.invalid_closes += 1;
                return RawSignal::Code(Z_STREAM_ERROR);
            }
        };
        self.stats.closed += 1;
        match file.state {
            GzState::Writing(buffer) => match fs::write(&file.path, gzip_member(&buffer)) {
                Ok(()) => RawSignal::Code(Z_OK),
                Err(e) => {
                    warn!("gzclose {}: {}", file.path.display(), e);
                    RawSignal::Code(Z_ERRNO)
                }
            },
            GzState::Reading { .. } => RawSignal::Code(Z_OK),
        }
    }

    fn dispatch(&mut self, call: &NativeCall) -> RawSignal {
        match call.function.as_str() {
            "deflateInit" => self.init_stream(Mode::Deflate, Some(call.int_at(0).unwrap_or(-1))),
            "inflateInit" => self.init_stream(Mode::Inflate, None),
            "gzopen" => self.gzopen(call),
            "deflate" => self.deflate(call),
            "inflate" => self.inflate(call),
            "gzwrite" => self.gzwrite(call),
            "deflateOutput" => self.stream_output(call, Mode::Deflate),
            "inflateOutput" => self.stream_output(call, Mode::Inflate),
            "deflateBound" => {
                let len = call.int_at(1).unwrap_or(0).max(0) as usize;
                match self.stream_mut(call.handle_at(0)) {
                    Some(Stream { mode: Mode::Deflate, .. }) => {
                        RawSignal::Value(Value::Int(deflate_bound(len) as i64))
                    }
                    _ => RawSignal::Code(Z_STREAM_ERROR),
                }
            }
            "gzread" => self.gzread(call),
            "compress" => match data_at(call, 0) {
                Some(data) => RawSignal::Value(Value::Bytes(zlib_wrap(&data))),
                None => RawSignal::Code(Z_STREAM_ERROR),
            },
            "uncompress" => match data_at(call, 0).map(|d| zlib_unwrap(&d)) {
                Some(Decoded::Complete { data, .. }) => RawSignal::Value(Value::Bytes(data)),
                Some(Decoded::Incomplete) => RawSignal::Code(Z_BUF_ERROR),
                Some(Decoded::Corrupt(_)) => RawSignal::Code(Z_DATA_ERROR),
                None => RawSignal::Code(Z_STREAM_ERROR),
            },
            "crc32" => {
                let init = call.int_at(0).unwrap_or(0) as u32;
                let data = data_at(call, 1).unwrap_or_default();
                RawSignal::Value(Value::Int(crc32(init, &data) as i64))
            }
            "adler32" => {
                let init = call.int_at(0).unwrap_or(1) as u32;
                let data = data_at(call, 1).unwrap_or_default();
                RawSignal::Value(Value::Int(adler32(init, &data) as i64))
            }
            "zlibVersion" => RawSignal::Value(Value::Text(VERSION.to_string())),
            "deflateEnd" => self.end_stream(call, Mode::Deflate),
            "inflateEnd" => self.end_stream(call, Mode::Inflate),
            "gzclose" => self.gzclose(call),
            other => RawSignal::unsupported(format!("{} is not exported by this zlib", other)),
        }
    }
}

/// Stream and gz-file functions that touch the filesystem
fn is_file_call(function: &str) -> bool {
    matches!(function, "gzopen" | "gzread" | "gzwrite" | "gzclose")
}

pub struct ZStream {
    state: Arc<Mutex<ZState>>,
    io_delay: Option<Duration>,
}

impl Default for ZStream {
    fn default() -> Self {
        Self::new()
    }
}

impl ZStream {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(ZState {
                resources: BTreeMap::new(),
                next: BASE_ADDRESS,
                stats: ZStats::default(),
            })),
            io_delay: None,
        }
    }

    /// Delay every file call, for exercising the watchdog.
    pub fn with_io_delay(mut self, delay: Duration) -> Self {
        self.io_delay = Some(delay);
        self
    }

    pub fn stats(&self) -> ZStats {
        match self.state.lock() {
            Ok(state) => state.stats.clone(),
            Err(_) => ZStats::default(),
        }
    }

    fn call(&self, call: &NativeCall) -> RawSignal {
        run_locked(&self.state, call)
    }
}

fn run_locked(state: &Mutex<ZState>, call: &NativeCall) -> RawSignal {
    match state.lock() {
        Ok(mut state) => state.dispatch(call),
        Err(_) => RawSignal::Crashed {
            detail: "zlib state lock poisoned".to_string(),
        },
    }
}

impl TargetLibrary for ZStream {
    fn name(&self) -> &str {
        LIBRARY_NAME
    }

    fn kinds(&self) -> Vec<HandleKind> {
        [KIND_DEFLATE, KIND_INFLATE, KIND_GZFILE]
            .iter()
            .map(|k| HandleKind::new(*k))
            .collect()
    }

    fn create(&mut self, call: &NativeCall) -> RawSignal {
        self.call(call)
    }

    fn mutate(&mut self, call: &NativeCall) -> RawSignal {
        self.call(call)
    }

    fn query(&mut self, call: &NativeCall) -> RawSignal {
        self.call(call)
    }

    fn destroy(&mut self, call: &NativeCall) -> RawSignal {
        self.call(call)
    }

    fn destructor(&self, kind: &HandleKind) -> Option<&'static str> {
        match kind.as_str() {
            KIND_DEFLATE => Some("deflateEnd"),
            KIND_INFLATE => Some("inflateEnd"),
            KIND_GZFILE => Some("gzclose"),
            _ => None,
        }
    }

    fn kind_of(&self, native: NativeHandle) -> Option<HandleKind> {
        self.state.lock().ok()?.kind_of(native.0)
    }

    fn offload(&mut self, call: &NativeCall) -> Option<BlockingCall> {
        if !is_file_call(&call.function) {
            return None;
        }
        let state = Arc::clone(&self.state);
        let call = call.clone();
        let delay = self.io_delay;
        Some(Box::new(move || {
            if let Some(delay) = delay {
                thread::sleep(delay);
            }
            run_locked(&state, &call)
        }))
    }
}
