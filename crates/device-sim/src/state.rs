//! Shared simulator state: call accounting, fault injection, live handles.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::thread::ThreadId;

use nvcap_common::error::{NvcapError, NvcapResult};
use nvcap_device_core::{CaptureSessionParams, EncoderInitParams, FrameSize, PicParams};

use crate::SimConfig;

/// Every operation the simulator can observe or fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SimOp {
    OpenDisplay,
    CloseDisplay,
    ChooseFbConfigs,
    CreateContext,
    DestroyContext,
    CreatePixmap,
    FreePixmap,
    CreateGlPixmap,
    DestroyGlPixmap,
    MakeCurrent,
    ReleaseCurrent,
    CreateCaptureInstance,
    CreateCaptureHandle,
    CaptureStatus,
    CreateCaptureSession,
    SetupGl,
    Grab,
    DestroyCaptureSession,
    DestroyCaptureHandle,
    CreateEncoderInstance,
    OpenEncodeSession,
    PresetConfig,
    InitializeEncoder,
    RegisterResource,
    UnregisterResource,
    CreateBitstreamBuffer,
    DestroyBitstreamBuffer,
    MapInput,
    UnmapInput,
    EncodePicture,
    LockBitstream,
    UnlockBitstream,
    DestroyEncoder,
}

impl SimOp {
    pub fn name(self) -> &'static str {
        match self {
            Self::OpenDisplay => "open_display",
            Self::CloseDisplay => "close_display",
            Self::ChooseFbConfigs => "choose_fb_configs",
            Self::CreateContext => "create_context",
            Self::DestroyContext => "destroy_context",
            Self::CreatePixmap => "create_pixmap",
            Self::FreePixmap => "free_pixmap",
            Self::CreateGlPixmap => "create_gl_pixmap",
            Self::DestroyGlPixmap => "destroy_gl_pixmap",
            Self::MakeCurrent => "make_current",
            Self::ReleaseCurrent => "release_current",
            Self::CreateCaptureInstance => "create_capture_instance",
            Self::CreateCaptureHandle => "create_capture_handle",
            Self::CaptureStatus => "capture_status",
            Self::CreateCaptureSession => "create_capture_session",
            Self::SetupGl => "setup_gl",
            Self::Grab => "grab",
            Self::DestroyCaptureSession => "destroy_capture_session",
            Self::DestroyCaptureHandle => "destroy_capture_handle",
            Self::CreateEncoderInstance => "create_encoder_instance",
            Self::OpenEncodeSession => "open_encode_session",
            Self::PresetConfig => "preset_config",
            Self::InitializeEncoder => "initialize_encoder",
            Self::RegisterResource => "register_resource",
            Self::UnregisterResource => "unregister_resource",
            Self::CreateBitstreamBuffer => "create_bitstream_buffer",
            Self::DestroyBitstreamBuffer => "destroy_bitstream_buffer",
            Self::MapInput => "map_input",
            Self::UnmapInput => "unmap_input",
            Self::EncodePicture => "encode_picture",
            Self::LockBitstream => "lock_bitstream",
            Self::UnlockBitstream => "unlock_bitstream",
            Self::DestroyEncoder => "destroy_encoder",
        }
    }
}

/// Status code reported for misuse the simulator detects on its own
/// (unknown handle, wrong order).
pub const STATUS_INVALID_CALL: i32 = 21;

/// Kinds of live device objects tracked for leak detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Resource {
    Display,
    Context,
    Pixmap,
    GlPixmap,
    Current,
    CaptureHandle,
    CaptureSession,
    Encoder,
    Registered,
    Mapped,
    Bitstream,
}

#[derive(Debug)]
pub(crate) struct SimState {
    pub config: SimConfig,
    next_id: u64,
    counts: HashMap<SimOp, u32>,
    log: Vec<SimOp>,
    threads: Vec<ThreadId>,
    fail_once: HashMap<SimOp, VecDeque<i32>>,
    fail_always: HashMap<SimOp, i32>,
    pub grab_script: VecDeque<bool>,
    live: BTreeMap<Resource, HashSet<u64>>,
    pub session_params: Vec<CaptureSessionParams>,
    pub init_params: Vec<EncoderInitParams>,
    pub pictures: Vec<PicParams>,
}

impl SimState {
    pub fn new(config: SimConfig) -> Self {
        Self {
            config,
            next_id: 1,
            counts: HashMap::new(),
            log: Vec::new(),
            threads: Vec::new(),
            fail_once: HashMap::new(),
            fail_always: HashMap::new(),
            grab_script: VecDeque::new(),
            live: BTreeMap::new(),
            session_params: Vec::new(),
            init_params: Vec::new(),
            pictures: Vec::new(),
        }
    }

    /// Account for a call and apply any injected fault.
    pub fn enter(&mut self, op: SimOp) -> NvcapResult<()> {
        *self.counts.entry(op).or_insert(0) += 1;
        self.log.push(op);

        let thread = std::thread::current().id();
        if !self.threads.contains(&thread) {
            self.threads.push(thread);
        }

        if let Some(status) = self.fail_once.get_mut(&op).and_then(VecDeque::pop_front) {
            tracing::debug!(op = op.name(), status, "Injected one-shot fault");
            return Err(NvcapError::device(op.name(), status));
        }
        if let Some(&status) = self.fail_always.get(&op) {
            return Err(NvcapError::device(op.name(), status));
        }
        Ok(())
    }

    pub fn fail_next(&mut self, op: SimOp, status: i32) {
        self.fail_once.entry(op).or_default().push_back(status);
    }

    pub fn fail_always(&mut self, op: SimOp, status: i32) {
        self.fail_always.insert(op, status);
    }

    pub fn clear_faults(&mut self) {
        self.fail_once.clear();
        self.fail_always.clear();
    }

    pub fn acquire(&mut self, kind: Resource) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.live.entry(kind).or_default().insert(id);
        id
    }

    /// Track an object whose id was chosen elsewhere.
    pub fn acquire_id(&mut self, kind: Resource, id: u64) {
        self.live.entry(kind).or_default().insert(id);
    }

    pub fn is_live(&self, kind: Resource, id: u64) -> bool {
        self.live.get(&kind).is_some_and(|ids| ids.contains(&id))
    }

    pub fn release(&mut self, kind: Resource, id: u64) -> bool {
        self.live.get_mut(&kind).is_some_and(|ids| ids.remove(&id))
    }

    pub fn invalid(&self, op: SimOp) -> NvcapError {
        NvcapError::device(op.name(), STATUS_INVALID_CALL)
    }

    pub fn screen(&self) -> FrameSize {
        self.config.screen
    }

    pub fn report(&self) -> SimReport {
        SimReport {
            counts: self.counts.clone(),
            log: self.log.clone(),
            thread_count: self.threads.len(),
            threads: self.threads.clone(),
            live: self
                .live
                .iter()
                .filter(|(_, ids)| !ids.is_empty())
                .map(|(kind, ids)| (*kind, ids.len()))
                .collect(),
            session_params: self.session_params.clone(),
            init_params: self.init_params.clone(),
            pictures: self.pictures.clone(),
        }
    }
}

/// Snapshot of everything the simulator observed.
#[derive(Debug, Clone)]
pub struct SimReport {
    counts: HashMap<SimOp, u32>,
    /// Every call in order.
    pub log: Vec<SimOp>,
    /// Distinct threads that called into any device.
    pub thread_count: usize,
    pub threads: Vec<ThreadId>,
    /// Objects still alive, by kind.
    pub live: BTreeMap<Resource, usize>,
    /// Every capture session creation request.
    pub session_params: Vec<CaptureSessionParams>,
    /// Every encoder initialization request.
    pub init_params: Vec<EncoderInitParams>,
    /// Every picture submitted for encoding.
    pub pictures: Vec<PicParams>,
}

impl SimReport {
    pub fn count(&self, op: SimOp) -> u32 {
        self.counts.get(&op).copied().unwrap_or(0)
    }

    /// True when nothing acquired from any device is still alive.
    pub fn is_clean(&self) -> bool {
        self.live.is_empty()
    }

    /// Position of the first occurrence of `op` at or after `from`.
    pub fn position_after(&self, op: SimOp, from: usize) -> Option<usize> {
        self.log
            .iter()
            .skip(from)
            .position(|logged| *logged == op)
            .map(|offset| offset + from)
    }

    /// Whether `ops` appear in the call log in this relative order.
    pub fn in_order(&self, ops: &[SimOp]) -> bool {
        let mut cursor = 0;
        for op in ops {
            match self.position_after(*op, cursor) {
                Some(at) => cursor = at + 1,
                None => return false,
            }
        }
        true
    }
}
