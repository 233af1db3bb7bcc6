//! Custom AVIOContext bridge
//!
//! Inputs are bound to a read/seek `AVIOContext` whose opaque pointer is a
//! boxed [`InputCtx`]. Outputs are opened lazily by the muxer through the
//! `io_open`/`io_close2` hooks on the output `AVFormatContext`; its `opaque`
//! field points at an [`OutputTracker`] that classifies each URL and opens the
//! matching handler through the [`HandleRegistry`].
//!
//! # Thread safety
//! Every callback runs synchronously inside an FFmpeg call made by the thread
//! that owns the session, so the tracker uses `Cell`/`RefCell` rather than
//! locks.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::ffi::{c_char, c_int, c_void, CStr, CString};
use std::ptr;
use std::sync::Arc;

use ffmpeg_next as ffmpeg;
use ffmpeg::ffi::{AVDictionary, AVFormatContext, AVIOContext};

use super::crypto::{Aes128Cbc, CRYPTO_PREFIX};
use super::{
    classify_output, AvType, HandleRegistry, InputBackend, InputHandler, OutputBackend,
    OutputHandler, StatKind, Whence,
};
use crate::config::IoConfig;
use crate::error::{AvpipeError, FfmpegError, Result};

/// AVIO buffer handed to the muxer for each output
const OUTPUT_AVIO_BUFFER: usize = 64 * 1024;

fn averror_io() -> c_int {
    ffmpeg::ffi::AVERROR(ffmpeg::ffi::EIO)
}

// ── Input ────────────────────────────────────────────────────────────────────

struct InputCtx {
    backend: InputBackend,
    fd: i64,
    read_bytes: u64,
    read_pos: i64,
    reported: u64,
    report_every: u64,
    closed: bool,
    error: Option<AvpipeError>,
}

impl InputCtx {
    fn read(&mut self, buf: &mut [u8]) -> c_int {
        match self.backend.read(buf) {
            Ok(0) => ffmpeg::ffi::AVERROR_EOF,
            Ok(n) => {
                self.read_bytes += n as u64;
                self.read_pos += n as i64;
                if self.read_bytes - self.reported >= self.report_every {
                    self.reported = self.read_bytes;
                    if let Err(e) = self.backend.stat(StatKind::BytesRead, self.read_bytes as i64) {
                        tracing::warn!(fd = self.fd, error = %e, "input stat failed");
                    }
                }
                n as c_int
            }
            Err(e) => {
                tracing::warn!(fd = self.fd, error = %e, "input read failed");
                self.error = Some(e);
                averror_io()
            }
        }
    }

    fn seek(&mut self, offset: i64, whence: c_int) -> i64 {
        let whence = match Whence::from_raw(whence) {
            Ok(w) => w,
            Err(e) => {
                tracing::warn!(fd = self.fd, error = %e, "input seek rejected");
                return averror_io() as i64;
            }
        };
        if whence == Whence::Size {
            if let Some(size) = self.backend.size() {
                return size;
            }
        }
        match self.backend.seek(offset, whence) {
            Ok(pos) => {
                if whence != Whence::Size {
                    self.read_pos = pos;
                }
                pos
            }
            Err(e) => {
                tracing::debug!(fd = self.fd, offset, ?whence, error = %e, "input seek failed");
                averror_io() as i64
            }
        }
    }
}

unsafe extern "C" fn input_read(opaque: *mut c_void, buf: *mut u8, buf_size: c_int) -> c_int {
    if opaque.is_null() || buf.is_null() || buf_size <= 0 {
        return averror_io();
    }
    // SAFETY: `opaque` is the `InputCtx` boxed in `open_input`, alive until
    // `InputAvio` is dropped, and `buf` is a writable buffer of `buf_size`
    // bytes owned by the AVIOContext.
    let ctx = &mut *(opaque as *mut InputCtx);
    let slice = std::slice::from_raw_parts_mut(buf, buf_size as usize);
    ctx.read(slice)
}

unsafe extern "C" fn input_seek(opaque: *mut c_void, offset: i64, whence: c_int) -> i64 {
    if opaque.is_null() {
        return averror_io() as i64;
    }
    // SAFETY: as in `input_read`.
    let ctx = &mut *(opaque as *mut InputCtx);
    ctx.seek(offset, whence)
}

/// Owns the input `AVIOContext`, its buffer and the handler behind it
pub struct InputAvio {
    avio: *mut AVIOContext,
    ctx: *mut InputCtx,
}

impl InputAvio {
    fn new(backend: InputBackend, fd: i64, config: &IoConfig, seekable: bool) -> Result<Self> {
        let size = backend.size();
        let ctx = Box::into_raw(Box::new(InputCtx {
            backend,
            fd,
            read_bytes: 0,
            read_pos: 0,
            reported: 0,
            report_every: config.bytes_read_report.max(1),
            closed: false,
            error: None,
        }));

        // SAFETY: the buffer is allocated with `av_malloc` as avio requires
        // and ownership passes to the AVIOContext on success. Every failure
        // path releases what was allocated so far.
        unsafe {
            let buffer = ffmpeg::ffi::av_malloc(config.input_buffer_size) as *mut u8;
            if buffer.is_null() {
                drop(Box::from_raw(ctx));
                return Err(FfmpegError::Alloc("input AVIO buffer".to_string()).into());
            }
            let avio = ffmpeg::ffi::avio_alloc_context(
                buffer,
                config.input_buffer_size as c_int,
                0,
                ctx as *mut c_void,
                Some(input_read),
                None,
                if seekable { Some(input_seek) } else { None },
            );
            if avio.is_null() {
                ffmpeg::ffi::av_free(buffer as *mut c_void);
                drop(Box::from_raw(ctx));
                return Err(FfmpegError::Alloc("input AVIO context".to_string()).into());
            }
            (*avio).seekable = if seekable {
                ffmpeg::ffi::AVIO_SEEKABLE_NORMAL as c_int
            } else {
                0
            };
            tracing::debug!(fd, ?size, seekable, "input AVIO ready");
            Ok(Self { avio, ctx })
        }
    }

    pub fn fd(&self) -> i64 {
        // SAFETY: `ctx` stays valid until drop.
        unsafe { (*self.ctx).fd }
    }

    pub fn bytes_read(&self) -> u64 {
        unsafe { (*self.ctx).read_bytes }
    }

    /// Handler error recorded by the last failing callback, if any.
    pub fn take_error(&mut self) -> Option<AvpipeError> {
        unsafe { (*self.ctx).error.take() }
    }

    /// Close the handler; later calls are no-ops.
    pub fn close(&mut self) -> Result<()> {
        // SAFETY: no FFmpeg call is in flight while the owner holds `&mut self`.
        let ctx = unsafe { &mut *self.ctx };
        if ctx.closed {
            return Ok(());
        }
        ctx.closed = true;
        if let Err(e) = ctx.backend.stat(StatKind::BytesRead, ctx.read_bytes as i64) {
            tracing::warn!(fd = ctx.fd, error = %e, "input stat failed");
        }
        tracing::debug!(fd = ctx.fd, bytes = ctx.read_bytes, pos = ctx.read_pos, "input closed");
        ctx.backend.close()
    }
}

impl Drop for InputAvio {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!(error = %e, "input close failed");
        }
        // SAFETY: the format context that used this AVIOContext has been
        // closed already (see `CustomInput` field order). The buffer may have
        // been reallocated by avio, so it is freed through the context.
        unsafe {
            if !self.avio.is_null() {
                ffmpeg::ffi::av_freep(&mut (*self.avio).buffer as *mut _ as *mut c_void);
                ffmpeg::ffi::avio_context_free(&mut self.avio);
            }
            if !self.ctx.is_null() {
                drop(Box::from_raw(self.ctx));
                self.ctx = ptr::null_mut();
            }
        }
    }
}

/// An opened demuxer reading through a custom AVIOContext
///
/// Field order matters: the format context must close before the AVIO
/// context it reads from is freed.
pub struct CustomInput {
    pub input: ffmpeg::format::context::Input,
    pub avio: InputAvio,
}

/// Open `backend` as a demuxer input and run stream-info discovery.
pub fn open_input(
    backend: InputBackend,
    fd: i64,
    url: &str,
    config: &IoConfig,
    seekable: bool,
) -> Result<CustomInput> {
    let mut avio = InputAvio::new(backend, fd, config, seekable)?;
    let url_c = CString::new(url).map_err(|_| AvpipeError::Config(format!("bad url {}", url)))?;

    // SAFETY: the format context is freshly allocated and owned here until it
    // is wrapped. `avformat_open_input` frees it on failure. The custom pb is
    // never closed by libavformat because of `AVFMT_FLAG_CUSTOM_IO`.
    let input = unsafe {
        let mut fmt_ctx = ffmpeg::ffi::avformat_alloc_context();
        if fmt_ctx.is_null() {
            return Err(FfmpegError::Alloc("input format context".to_string()).into());
        }
        (*fmt_ctx).pb = avio.avio;
        (*fmt_ctx).flags |= ffmpeg::ffi::AVFMT_FLAG_CUSTOM_IO as c_int;

        let ret = ffmpeg::ffi::avformat_open_input(
            &mut fmt_ctx,
            url_c.as_ptr(),
            ptr::null(),
            ptr::null_mut(),
        );
        if ret < 0 {
            let cause = avio
                .take_error()
                .map(|e| e.to_string())
                .unwrap_or_else(|| ffmpeg::Error::from(ret).to_string());
            return Err(FfmpegError::OpenInput(format!("{}: {}", url, cause)).into());
        }
        let input = ffmpeg::format::context::Input::wrap(fmt_ctx);

        let ret = ffmpeg::ffi::avformat_find_stream_info(fmt_ctx, ptr::null_mut());
        if ret < 0 {
            return Err(FfmpegError::FindStreamInfo(format!(
                "{}: {}",
                url,
                ffmpeg::Error::from(ret)
            ))
            .into());
        }
        input
    };

    tracing::debug!(
        fd,
        url,
        format = input.format().name(),
        streams = input.streams().count(),
        "input opened"
    );
    Ok(CustomInput { input, avio })
}

// ── Output ───────────────────────────────────────────────────────────────────

struct OutputCtx {
    backend: OutputBackend,
    fd: i64,
    kind: AvType,
    stream_index: i32,
    seg_index: i32,
    written: u64,
    cipher: Option<Aes128Cbc>,
    error: Option<AvpipeError>,
}

impl OutputCtx {
    fn write_all(&mut self, mut data: &[u8]) -> Result<()> {
        while !data.is_empty() {
            let n = self.backend.write(data)?;
            if n == 0 {
                return Err(AvpipeError::io("write", "output accepted no bytes"));
            }
            self.written += n as u64;
            data = &data[n..];
        }
        Ok(())
    }

    /// Write the padded final block of an encrypted output.
    fn finish_cipher(&mut self) -> Result<()> {
        match self.cipher.as_mut().map(|c| c.finish()) {
            Some(tail) => self.write_all(&tail),
            None => Ok(()),
        }
    }
}

unsafe extern "C" fn output_write(opaque: *mut c_void, buf: *const u8, buf_size: c_int) -> c_int {
    if opaque.is_null() || buf.is_null() || buf_size < 0 {
        return averror_io();
    }
    // SAFETY: `opaque` is the boxed `OutputCtx` created in
    // `OutputTracker::open`, valid until the matching close.
    let ctx = &mut *(opaque as *mut OutputCtx);
    let slice = std::slice::from_raw_parts(buf, buf_size as usize);
    let result = match ctx.cipher.as_mut().map(|c| c.update(slice)) {
        Some(encrypted) => ctx.write_all(&encrypted).map(|()| slice.len()),
        // the muxer treats any return as the whole buffer, so short writes loop
        None => ctx.write_all(slice).map(|()| slice.len()),
    };
    match result {
        Ok(n) => n as c_int,
        Err(e) => {
            tracing::warn!(fd = ctx.fd, kind = %ctx.kind, error = %e, "output write failed");
            ctx.error = Some(e);
            averror_io()
        }
    }
}

unsafe extern "C" fn output_seek(opaque: *mut c_void, offset: i64, whence: c_int) -> i64 {
    if opaque.is_null() {
        return averror_io() as i64;
    }
    // SAFETY: as in `output_write`.
    let ctx = &mut *(opaque as *mut OutputCtx);
    let result = Whence::from_raw(whence).and_then(|w| ctx.backend.seek(offset, w));
    match result {
        Ok(pos) => pos,
        Err(e) => {
            tracing::debug!(fd = ctx.fd, offset, whence, error = %e, "output seek failed");
            averror_io() as i64
        }
    }
}

/// Per-session state behind the muxer's `io_open`/`io_close2` hooks
pub struct OutputTracker {
    registry: Arc<HandleRegistry>,
    handle: i64,
    video_index: Option<i32>,
    first_segment: i32,
    seg_counters: RefCell<HashMap<i32, i32>>,
    opened: Cell<usize>,
    bytes_written: Cell<u64>,
    decoding_start_pts: Cell<Option<i64>>,
    encoding_end_pts: Cell<Option<i64>>,
    error: RefCell<Option<AvpipeError>>,
}

impl OutputTracker {
    /// `handle` is the input connection; `video_index` is the output stream
    /// index carrying video, if any.
    pub fn new(
        registry: Arc<HandleRegistry>,
        handle: i64,
        video_index: Option<i32>,
        start_segment: u32,
    ) -> Self {
        Self {
            registry,
            handle,
            video_index,
            first_segment: start_segment.max(1) as i32,
            seg_counters: RefCell::new(HashMap::new()),
            opened: Cell::new(0),
            bytes_written: Cell::new(0),
            decoding_start_pts: Cell::new(None),
            encoding_end_pts: Cell::new(None),
            error: RefCell::new(None),
        }
    }

    pub fn outputs_opened(&self) -> usize {
        self.opened.get()
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.get()
    }

    pub fn set_decoding_start_pts(&self, pts: i64) {
        if self.decoding_start_pts.get().is_none() {
            self.decoding_start_pts.set(Some(pts));
        }
    }

    pub fn set_encoding_end_pts(&self, pts: i64) {
        self.encoding_end_pts.set(Some(pts));
    }

    pub fn take_error(&self) -> Option<AvpipeError> {
        self.error.borrow_mut().take()
    }

    fn record_error(&self, e: AvpipeError) {
        let mut slot = self.error.borrow_mut();
        if slot.is_none() {
            *slot = Some(e);
        }
    }

    fn next_seg_index(&self, stream_index: i32) -> i32 {
        let mut counters = self.seg_counters.borrow_mut();
        let n = counters.entry(stream_index).or_insert(self.first_segment - 1);
        *n += 1;
        *n
    }

    /// Open the output the muxer named `url` and wrap it in an AVIOContext.
    pub fn open(&self, url: &str) -> Result<*mut AVIOContext> {
        self.open_with_cipher(url, None)
    }

    /// As [`Self::open`], encrypting everything written with `cipher`.
    pub fn open_with_cipher(
        &self,
        url: &str,
        cipher: Option<Aes128Cbc>,
    ) -> Result<*mut AVIOContext> {
        let class = classify_output(url, self.video_index);
        let seg_index = if class.numbered {
            self.next_seg_index(class.stream_index)
        } else {
            match class.kind {
                AvType::DashManifest
                | AvType::HlsMasterM3u
                | AvType::Aes128Key
                | AvType::Mp4Stream
                | AvType::Fmp4Stream => 0,
                _ => -1,
            }
        };

        let (fd, mut backend) =
            self.registry
                .open_output(self.handle, class.stream_index, seg_index, class.kind)?;
        if let Some(pts) = self.decoding_start_pts.get() {
            if let Err(e) = backend.stat(StatKind::DecodingStartPts, pts) {
                tracing::warn!(fd, kind = %class.kind, error = %e, "output stat failed");
            }
        }

        // CBC output cannot be rewritten in place
        let seekable = class.kind.needs_seek() && cipher.is_none();
        let ctx = Box::into_raw(Box::new(OutputCtx {
            backend,
            fd,
            kind: class.kind,
            stream_index: class.stream_index,
            seg_index,
            written: 0,
            cipher,
            error: None,
        }));

        // SAFETY: same allocation discipline as `InputAvio::new`.
        let avio = unsafe {
            let buffer = ffmpeg::ffi::av_malloc(OUTPUT_AVIO_BUFFER) as *mut u8;
            if buffer.is_null() {
                self.discard(ctx);
                return Err(FfmpegError::Alloc("output AVIO buffer".to_string()).into());
            }
            let avio = ffmpeg::ffi::avio_alloc_context(
                buffer,
                OUTPUT_AVIO_BUFFER as c_int,
                1,
                ctx as *mut c_void,
                None,
                Some(output_write),
                if seekable { Some(output_seek) } else { None },
            );
            if avio.is_null() {
                ffmpeg::ffi::av_free(buffer as *mut c_void);
                self.discard(ctx);
                return Err(FfmpegError::Alloc("output AVIO context".to_string()).into());
            }
            if seekable {
                (*avio).seekable = ffmpeg::ffi::AVIO_SEEKABLE_NORMAL as c_int;
            } else {
                (*avio).seekable = 0;
                (*avio).direct = 1;
            }
            avio
        };

        self.opened.set(self.opened.get() + 1);
        tracing::debug!(
            handle = self.handle,
            fd,
            url,
            kind = %class.kind,
            stream_index = class.stream_index,
            seg_index,
            "muxer output opened"
        );
        Ok(avio)
    }

    /// Release a context whose AVIO wrapper could not be created.
    unsafe fn discard(&self, ctx: *mut OutputCtx) {
        let mut ctx = Box::from_raw(ctx);
        if let Err(e) = ctx.backend.close() {
            tracing::warn!(fd = ctx.fd, kind = %ctx.kind, error = %e, "output close failed");
        }
        self.registry.close_output(self.handle, ctx.fd);
    }

    /// Flush, close and free an AVIOContext created by [`Self::open`].
    ///
    /// # Safety
    /// `pb` must come from `open` on this tracker and must not be used again.
    pub unsafe fn close(&self, mut pb: *mut AVIOContext) -> Result<()> {
        if pb.is_null() {
            return Ok(());
        }
        ffmpeg::ffi::avio_flush(pb);
        let ctx_ptr = (*pb).opaque as *mut OutputCtx;
        ffmpeg::ffi::av_freep(&mut (*pb).buffer as *mut _ as *mut c_void);
        ffmpeg::ffi::avio_context_free(&mut pb);
        if ctx_ptr.is_null() {
            return Ok(());
        }

        let mut ctx = Box::from_raw(ctx_ptr);
        if let Err(e) = ctx.finish_cipher() {
            ctx.error.get_or_insert(e);
        }
        self.bytes_written.set(self.bytes_written.get() + ctx.written);
        if let Err(e) = ctx.backend.stat(StatKind::BytesWritten, ctx.written as i64) {
            tracing::warn!(fd = ctx.fd, kind = %ctx.kind, error = %e, "output stat failed");
        }
        if matches!(
            ctx.kind,
            AvType::DashVideoSegment
                | AvType::DashAudioSegment
                | AvType::Mp4Segment
                | AvType::Fmp4Segment
        ) {
            if let Some(pts) = self.encoding_end_pts.get() {
                if let Err(e) = ctx.backend.stat(StatKind::EncodingEndPts, pts) {
                    tracing::warn!(fd = ctx.fd, kind = %ctx.kind, error = %e, "output stat failed");
                }
            }
        }
        let closed = ctx.backend.close();
        self.registry.close_output(self.handle, ctx.fd);
        tracing::debug!(
            fd = ctx.fd,
            kind = %ctx.kind,
            stream_index = ctx.stream_index,
            seg_index = ctx.seg_index,
            bytes = ctx.written,
            "muxer output closed"
        );

        if let Some(e) = ctx.error.take() {
            return Err(e);
        }
        closed
    }
}

unsafe extern "C" fn hook_io_open(
    s: *mut AVFormatContext,
    pb: *mut *mut AVIOContext,
    url: *const c_char,
    flags: c_int,
    options: *mut *mut AVDictionary,
) -> c_int {
    if s.is_null() || pb.is_null() || (*s).opaque.is_null() {
        return averror_io();
    }
    // SAFETY: `opaque` was set by `CustomOutput::new` to a tracker that lives
    // as long as the output context (and every child context that inherited
    // the hooks).
    let tracker = &*((*s).opaque as *const OutputTracker);
    if flags & ffmpeg::ffi::AVIO_FLAG_READ as c_int != 0 {
        tracing::debug!("muxer asked to read back an output; refusing");
        return averror_io();
    }
    let url = if url.is_null() {
        String::new()
    } else {
        CStr::from_ptr(url).to_string_lossy().into_owned()
    };
    let opened = match url.strip_prefix(CRYPTO_PREFIX) {
        Some(name) => {
            let key = dict_get(options, "encryption_key");
            let iv = dict_get(options, "encryption_iv");
            match (key, iv) {
                (Some(key), Some(iv)) => Aes128Cbc::from_hex(&key, &iv)
                    .and_then(|cipher| tracker.open_with_cipher(name, Some(cipher))),
                _ => Err(AvpipeError::Config(format!(
                    "encrypted output {} opened without key and IV",
                    name
                ))),
            }
        }
        None => tracker.open(&url),
    };
    match opened {
        Ok(avio) => {
            *pb = avio;
            0
        }
        Err(e) => {
            tracing::error!(url, error = %e, "failed to open muxer output");
            tracker.record_error(e);
            averror_io()
        }
    }
}

/// Value of `key` in the dictionary handed to `io_open`, if present.
unsafe fn dict_get(options: *mut *mut AVDictionary, key: &str) -> Option<String> {
    if options.is_null() || (*options).is_null() {
        return None;
    }
    let key_c = CString::new(key).ok()?;
    let entry = ffmpeg::ffi::av_dict_get(*options, key_c.as_ptr(), ptr::null(), 0);
    if entry.is_null() || (*entry).value.is_null() {
        return None;
    }
    Some(CStr::from_ptr((*entry).value).to_string_lossy().into_owned())
}

unsafe extern "C" fn hook_io_close2(s: *mut AVFormatContext, pb: *mut AVIOContext) -> c_int {
    if s.is_null() || (*s).opaque.is_null() {
        return 0;
    }
    // SAFETY: as in `hook_io_open`.
    let tracker = &*((*s).opaque as *const OutputTracker);
    match tracker.close(pb) {
        Ok(()) => 0,
        Err(e) => {
            tracing::error!(error = %e, "failed to close muxer output");
            tracker.record_error(e);
            averror_io()
        }
    }
}

/// An output format context whose every file goes through an [`OutputTracker`]
///
/// Field order matters: `output` is freed before the tracker its hooks
/// point at.
pub struct CustomOutput {
    pub output: ffmpeg::format::context::Output,
    main_pb: *mut AVIOContext,
    tracker: Box<OutputTracker>,
}

impl CustomOutput {
    /// Allocate an output context for `muxer`, install the I/O hooks and, for
    /// muxers that write a single file, open that file up front.
    pub fn new(muxer: &str, url: &str, tracker: OutputTracker) -> Result<Self> {
        let tracker = Box::new(tracker);
        let muxer_c = CString::new(muxer).map_err(|_| AvpipeError::Config(muxer.to_string()))?;
        let url_c = CString::new(url).map_err(|_| AvpipeError::Config(url.to_string()))?;

        // SAFETY: the context is allocated here and immediately wrapped so
        // that every later failure frees it. The tracker box is stable for
        // the lifetime of `Self`.
        unsafe {
            let mut ctx: *mut AVFormatContext = ptr::null_mut();
            let ret = ffmpeg::ffi::avformat_alloc_output_context2(
                &mut ctx,
                ptr::null(),
                muxer_c.as_ptr(),
                url_c.as_ptr(),
            );
            if ret < 0 || ctx.is_null() {
                return Err(FfmpegError::MuxerCreate(format!(
                    "{}: {}",
                    muxer,
                    ffmpeg::Error::from(ret)
                ))
                .into());
            }
            (*ctx).opaque = &*tracker as *const OutputTracker as *mut c_void;
            (*ctx).io_open = Some(hook_io_open);
            (*ctx).io_close2 = Some(hook_io_close2);
            (*ctx).flags |= ffmpeg::ffi::AVFMT_FLAG_CUSTOM_IO as c_int;

            let mut this = Self {
                output: ffmpeg::format::context::Output::wrap(ctx),
                main_pb: ptr::null_mut(),
                tracker,
            };

            let nofile = ((*(*ctx).oformat).flags & ffmpeg::ffi::AVFMT_NOFILE as c_int) != 0;
            if !nofile {
                let pb = this.tracker.open(url)?;
                (*ctx).pb = pb;
                this.main_pb = pb;
            }
            Ok(this)
        }
    }

    pub fn tracker(&self) -> &OutputTracker {
        &self.tracker
    }

    /// Flush and close the single-file output, if this muxer has one.
    pub fn close_main(&mut self) -> Result<()> {
        if self.main_pb.is_null() {
            return Ok(());
        }
        crate::ffmpeg_utils::helpers::detach_avio(&mut self.output);
        let pb = std::mem::replace(&mut self.main_pb, ptr::null_mut());
        // SAFETY: `pb` came from `tracker.open` and is no longer referenced by
        // the format context.
        unsafe { self.tracker.close(pb) }
    }
}

impl Drop for CustomOutput {
    fn drop(&mut self) {
        if let Err(e) = self.close_main() {
            tracing::warn!(error = %e, "output close failed");
        }
    }
}
