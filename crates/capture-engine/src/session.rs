//! Capture + encoder session lifecycle.
//!
//! A session is everything between the rendering context and a frame: the
//! capture handle and session, its textures, the encoder session, one
//! registered input per texture, and one output buffer. It is built as a
//! unit and torn down as a unit; a parameter change or a stale capture
//! session means teardown followed by a fresh build.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use nvcap_common::clock::{frame_duration_ns, target_fps};
use nvcap_common::config::SessionDefaults;
use nvcap_common::error::{NvcapError, NvcapResult};
use nvcap_device_core::{
    BitstreamBuffer, BufferFormat, CaptureApi, CaptureHandle, CaptureSessionParams, Codec,
    DeviceFactory, DeviceType, EncoderApi, EncoderHandle, EncoderInitParams, FrameSize,
    GlBinding, GrabFlags, GrabInfo, Level, MappedInput, MappedResource, PicParams,
    PictureStruct, PictureType, Preset, Profile, RateControlMode, RegisterResource,
    RegisteredResource, TextureSetup, TrackingType, MAX_TEXTURES,
};

use crate::stats::WorkerStats;

/// Caller-controlled session parameters. Any change forces a rebuild.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionParams {
    pub fps_n: u32,
    pub fps_d: u32,
    /// Average and peak bitrate in bits per second.
    pub bitrate: u32,
    /// Takes part in change detection only; sessions never overlay the
    /// pointer.
    pub show_pointer: bool,
}

impl SessionParams {
    pub fn new(fps_n: u32, fps_d: u32, bitrate: u32) -> Self {
        Self {
            fps_n,
            fps_d,
            bitrate,
            show_pointer: false,
        }
    }

    pub fn with_pointer(mut self, show_pointer: bool) -> Self {
        self.show_pointer = show_pointer;
        self
    }

    pub fn validate(&self) -> NvcapResult<()> {
        if self.fps_n == 0 || self.fps_d == 0 {
            return Err(NvcapError::invalid_params(format!(
                "frame rate {}/{} has a zero term",
                self.fps_n, self.fps_d
            )));
        }
        Ok(())
    }

    pub fn target_fps(&self) -> u32 {
        target_fps(self.fps_n, self.fps_d)
    }

    pub fn frame_duration_ns(&self) -> u64 {
        frame_duration_ns(self.fps_n, self.fps_d)
    }
}

impl From<&SessionDefaults> for SessionParams {
    fn from(defaults: &SessionDefaults) -> Self {
        Self {
            fps_n: defaults.fps_n,
            fps_d: defaults.fps_d,
            bitrate: defaults.bitrate,
            show_pointer: defaults.show_pointer,
        }
    }
}

/// Keyframe interval for a frame rate: about a quarter second at high
/// rates, longer as the rate drops.
pub fn gop_length_for(fps_n: u32, fps_d: u32) -> u32 {
    match target_fps(fps_n, fps_d) {
        fps if fps >= 60 => 15,
        fps if fps >= 30 => 30,
        _ => 60,
    }
}

/// What a built session negotiated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionInfo {
    /// Negotiated frame geometry (width aligned).
    pub size: FrameSize,
    /// Geometry the device reported.
    pub screen: FrameSize,
    pub gop_length: u32,
    pub params: SessionParams,
    pub built_at: DateTime<Utc>,
}

/// Fetched encode output.
pub(crate) struct EncodedPicture {
    pub data: Vec<u8>,
    pub picture_type: PictureType,
}

pub(crate) struct SessionManager {
    factory: Arc<dyn DeviceFactory>,
    stats: Arc<WorkerStats>,
    binding: GlBinding,
    params: SessionParams,
    gop_length: u32,
    generation: u64,

    capture: Option<Box<dyn CaptureApi>>,
    capture_handle: Option<CaptureHandle>,
    session_open: bool,
    textures: TextureSetup,
    screen: FrameSize,
    size: FrameSize,

    encoder_api: Option<Box<dyn EncoderApi>>,
    encoder: Option<EncoderHandle>,
    registered: [Option<RegisteredResource>; MAX_TEXTURES],
    output: Option<BitstreamBuffer>,
    /// Output buffer left locked by a failed unlock.
    locked: Option<BitstreamBuffer>,
    /// Input left mapped by a failed unmap.
    mapped: Option<MappedResource>,
    built_at: Option<DateTime<Utc>>,
}

impl SessionManager {
    /// An unbuilt session bound to `binding`. `gop_length` is reported
    /// until the first build derives one from the frame rate.
    pub fn new(
        factory: Arc<dyn DeviceFactory>,
        stats: Arc<WorkerStats>,
        binding: GlBinding,
        params: SessionParams,
        gop_length: u32,
    ) -> Self {
        Self {
            factory,
            stats,
            binding,
            params,
            gop_length,
            generation: 0,
            capture: None,
            capture_handle: None,
            session_open: false,
            textures: TextureSetup::default(),
            screen: FrameSize::default(),
            size: FrameSize::default(),
            encoder_api: None,
            encoder: None,
            registered: [None; MAX_TEXTURES],
            output: None,
            locked: None,
            mapped: None,
            built_at: None,
        }
    }

    pub fn params(&self) -> SessionParams {
        self.params
    }

    pub fn is_built(&self) -> bool {
        self.output.is_some()
    }

    /// Incremented by every successful build.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn info(&self) -> Option<SessionInfo> {
        let built_at = self.built_at?;
        Some(SessionInfo {
            size: self.size,
            screen: self.screen,
            gop_length: self.gop_length,
            params: self.params,
            built_at,
        })
    }

    /// Build a session for `params`. On failure everything built so far
    /// is torn down before the error is returned.
    pub fn build(&mut self, params: SessionParams) -> NvcapResult<SessionInfo> {
        params.validate()?;
        if self.capture_handle.is_some() || self.encoder.is_some() {
            self.teardown()?;
        }
        self.params = params;

        if let Err(e) = self.build_steps() {
            tracing::error!(error = %e, "Session build failed");
            if let Err(teardown) = self.teardown() {
                tracing::warn!(error = %teardown, "Teardown after failed build reported an error");
            }
            return Err(e);
        }

        self.generation += 1;
        self.stats.record_build();
        let built_at = Utc::now();
        self.built_at = Some(built_at);

        tracing::info!(
            size = %self.size,
            screen = %self.screen,
            gop = self.gop_length,
            fps_n = params.fps_n,
            fps_d = params.fps_d,
            bitrate = params.bitrate,
            "Session built"
        );

        Ok(SessionInfo {
            size: self.size,
            screen: self.screen,
            gop_length: self.gop_length,
            params,
            built_at,
        })
    }

    /// Teardown then build. Teardown errors are logged; the build result
    /// is what counts.
    pub fn rebuild(&mut self, params: SessionParams) -> NvcapResult<SessionInfo> {
        if let Err(e) = self.teardown() {
            tracing::warn!(error = %e, "Teardown before rebuild reported an error");
        }
        self.build(params)
    }

    fn build_steps(&mut self) -> NvcapResult<()> {
        let fps = self.params.target_fps();

        let capture = self.capture.insert(self.factory.capture()?);
        let handle = capture.create_handle(self.binding)?;
        self.capture_handle = Some(handle);

        let status = capture.status(handle)?;
        if !status.can_create_now {
            return Err(NvcapError::display("capture device cannot create a session now"));
        }
        let size = status.screen_size.aligned();
        if size.is_empty() {
            return Err(NvcapError::display(format!(
                "device reported an empty screen ({})",
                status.screen_size
            )));
        }
        if size != status.screen_size {
            tracing::debug!(raw = %status.screen_size, aligned = %size, "Padded capture width");
        }

        if self.params.show_pointer {
            tracing::debug!("Pointer requested; capture session is created without cursor");
        }
        let sampling_rate_ms = 1000 / fps;
        tracing::debug!(sampling_rate_ms, "Capture sampling interval (push model ignores it)");
        let session = CaptureSessionParams {
            frame_size: size,
            with_cursor: false,
            tracking: TrackingType::Screen,
            push_model: true,
            allow_direct_capture: true,
            disable_auto_modeset_recovery: true,
            sampling_rate_ms,
        };
        capture.create_session(handle, &session)?;
        self.session_open = true;
        self.textures = capture.setup_gl(handle, BufferFormat::Nv12)?;

        let encoder_api = self.encoder_api.insert(self.factory.encoder()?);
        let encoder = encoder_api.open_session(DeviceType::OpenGl, self.binding)?;
        self.encoder = Some(encoder);

        let gop = gop_length_for(self.params.fps_n, self.params.fps_d);
        let config = encoder_api
            .preset_config(encoder, Codec::H264, Preset::LowLatencyDefault)?
            .with_profile(Profile::High)
            .with_rate_control_mode(RateControlMode::ConstantBitrateLowDelayHq {
                bitrate: self.params.bitrate,
            })
            .with_vbv_buffer_size(0)
            .with_zero_reorder_delay(true)
            .with_gop_length(gop)
            .with_vui_timing(self.params.fps_d, self.params.fps_n.saturating_mul(2))
            .with_h264(|h264| {
                h264.repeat_sps_pps = false;
                h264.output_aud = true;
                h264.output_picture_timing_sei = true;
                h264.chroma_format_idc = 1;
                h264.level = Level::AutoSelect;
            });
        let init = EncoderInitParams::new(Codec::H264, size, BufferFormat::Nv12)
            .with_preset(Preset::LowLatencyDefault)
            .with_frame_rate(self.params.fps_n, self.params.fps_d)
            .with_encode_config(config);
        encoder_api.initialize(encoder, &init)?;

        for (slot, texture) in self.textures.populated() {
            let resource = RegisterResource {
                texture,
                target: self.textures.target,
                size,
                pitch: size.width,
                format: BufferFormat::Nv12,
            };
            self.registered[slot] = Some(encoder_api.register_resource(encoder, &resource)?);
        }
        self.output = Some(encoder_api.create_bitstream_buffer(encoder)?);

        self.screen = status.screen_size;
        self.size = size;
        self.gop_length = gop;
        Ok(())
    }

    /// Release everything in reverse build order.
    ///
    /// Best effort: every present resource gets a release attempt and all
    /// fields are cleared whatever happens. Returns the first failure;
    /// capture-handle destruction failures are only logged.
    pub fn teardown(&mut self) -> NvcapResult<()> {
        let mut first_error = None;
        let had_session = self.capture_handle.is_some() || self.encoder.is_some();

        if let (Some(api), Some(encoder)) = (self.encoder_api.as_mut(), self.encoder) {
            if let Some(buffer) = self.locked.take() {
                keep_first(&mut first_error, api.unlock_bitstream(encoder, buffer));
            }
            if let Some(mapped) = self.mapped.take() {
                keep_first(&mut first_error, api.unmap_input(encoder, mapped));
            }
            if let Some(buffer) = self.output.take() {
                keep_first(&mut first_error, api.destroy_bitstream_buffer(encoder, buffer));
            }
            for resource in self.registered.iter_mut().filter_map(Option::take) {
                keep_first(&mut first_error, api.unregister_resource(encoder, resource));
            }
            keep_first(&mut first_error, api.destroy_encoder(encoder));
        }
        self.locked = None;
        self.mapped = None;
        self.output = None;
        self.registered = [None; MAX_TEXTURES];
        self.encoder = None;
        self.encoder_api = None;

        if let (Some(api), Some(handle)) = (self.capture.as_mut(), self.capture_handle) {
            if self.session_open {
                keep_first(&mut first_error, api.destroy_session(handle));
            }
            if let Err(e) = api.destroy_handle(handle) {
                tracing::warn!(error = %e, "Failed to destroy capture handle");
            }
        }
        self.session_open = false;
        self.capture_handle = None;
        self.capture = None;
        self.textures = TextureSetup::default();
        self.built_at = None;

        if had_session {
            tracing::debug!(failed = first_error.is_some(), "Session torn down");
        }
        first_error.map_or(Ok(()), Err)
    }

    pub fn grab(&mut self) -> NvcapResult<GrabInfo> {
        let (Some(api), Some(handle)) = (self.capture.as_mut(), self.capture_handle) else {
            return Err(NvcapError::ContextPoisoned);
        };
        api.grab(handle, GrabFlags::LOW_LATENCY)
    }

    /// Map the registered input for a grabbed texture slot.
    pub fn map_slot(&mut self, slot: usize) -> NvcapResult<MappedInput> {
        let resource = self.registered.get(slot).copied().flatten().ok_or_else(|| {
            NvcapError::invalid_params(format!("no encoder input registered for texture slot {slot}"))
        })?;
        let (api, encoder) = self.encoder_mut()?;
        let input = api.map_input(encoder, resource)?;
        self.mapped = Some(input.resource);
        Ok(input)
    }

    pub fn pic_params(
        &self,
        input: MappedInput,
        frame_idx: u64,
        duration_ns: u64,
        timestamp_ns: u64,
        force_idr: bool,
    ) -> NvcapResult<PicParams> {
        let output = self.output.ok_or(NvcapError::ContextPoisoned)?;
        Ok(PicParams {
            input: input.resource,
            format: input.format,
            width: self.size.width,
            height: self.size.height,
            pitch: self.size.width,
            picture_struct: PictureStruct::Frame,
            frame_idx,
            input_duration_ns: duration_ns,
            input_timestamp_ns: timestamp_ns,
            force_idr,
            output,
        })
    }

    pub fn encode(&mut self, params: &PicParams) -> NvcapResult<()> {
        let (api, encoder) = self.encoder_mut()?;
        api.encode_picture(encoder, params)
    }

    /// Lock the output buffer, copy it out, unlock. The copy is dropped if
    /// the unlock fails; the buffer then stays locked until
    /// [`Self::release_outstanding`] or teardown.
    pub fn fetch_output(&mut self) -> NvcapResult<EncodedPicture> {
        let output = self.output.ok_or(NvcapError::ContextPoisoned)?;
        let (Some(api), Some(encoder)) = (self.encoder_api.as_mut(), self.encoder) else {
            return Err(NvcapError::ContextPoisoned);
        };
        let picture = {
            let locked = api.lock_bitstream(encoder, output)?;
            EncodedPicture {
                data: locked.data.to_vec(),
                picture_type: locked.picture_type,
            }
        };
        self.locked = Some(output);
        api.unlock_bitstream(encoder, output)?;
        self.locked = None;
        Ok(picture)
    }

    pub fn unmap(&mut self, mapped: MappedResource) -> NvcapResult<()> {
        let (api, encoder) = self.encoder_mut()?;
        api.unmap_input(encoder, mapped)?;
        if self.mapped == Some(mapped) {
            self.mapped = None;
        }
        Ok(())
    }

    /// Whether an earlier frame left the output locked or an input mapped.
    pub fn has_outstanding(&self) -> bool {
        self.locked.is_some() || self.mapped.is_some()
    }

    /// Retry the unlock and unmap a failed frame left behind.
    pub fn release_outstanding(&mut self) -> NvcapResult<()> {
        if let Some(buffer) = self.locked {
            let (api, encoder) = self.encoder_mut()?;
            api.unlock_bitstream(encoder, buffer)?;
            self.locked = None;
            tracing::debug!(buffer = buffer.0, "Released leftover bitstream lock");
        }
        if let Some(mapped) = self.mapped {
            self.unmap(mapped)?;
            tracing::debug!(mapped = mapped.0, "Released leftover input mapping");
        }
        Ok(())
    }

    fn encoder_mut(&mut self) -> NvcapResult<(&mut dyn EncoderApi, EncoderHandle)> {
        match (self.encoder_api.as_mut(), self.encoder) {
            (Some(api), Some(encoder)) => Ok((api.as_mut(), encoder)),
            _ => Err(NvcapError::ContextPoisoned),
        }
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        if let Err(e) = self.teardown() {
            tracing::warn!(error = %e, "Session teardown on drop failed");
        }
    }
}

fn keep_first(first: &mut Option<NvcapError>, result: NvcapResult<()>) {
    if let Err(e) = result {
        tracing::warn!(error = %e, "Session release failed");
        first.get_or_insert(e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nvcap_device_core::{DisplayHandle, FbConfigRequest, GlContext, GraphicsApi};
    use nvcap_device_sim::{Resource, SimDevices, SimOp, SimReport};
    use proptest::prelude::*;

    /// A live rendering context plus an unbuilt session bound to it.
    struct Fixture {
        devices: SimDevices,
        gl: Box<dyn GraphicsApi>,
        display: DisplayHandle,
        context: GlContext,
        session: SessionManager,
    }

    fn fixture(devices: SimDevices) -> Fixture {
        let mut gl = devices.graphics().unwrap();
        let display = gl.open_display(None).unwrap();
        let config = gl
            .choose_fb_configs(display.handle, &FbConfigRequest::TEXTURE_CAPTURE)
            .unwrap()[0];
        let context = gl.create_context(display.handle, config).unwrap();
        let binding = GlBinding {
            context,
            fb_config: config,
        };
        let session = SessionManager::new(
            Arc::new(devices.clone()),
            Arc::new(WorkerStats::default()),
            binding,
            SessionParams::new(30, 1, 2_000_000),
            10,
        );
        Fixture {
            devices,
            gl,
            display: display.handle,
            context,
            session,
        }
    }

    impl Fixture {
        /// Tear everything down and report what is still alive.
        fn finish(mut self) -> SimReport {
            self.session.teardown().unwrap();
            self.gl.destroy_context(self.display, self.context);
            self.gl.close_display(self.display);
            self.devices.report()
        }
    }

    #[test]
    fn gop_tracks_frame_rate() {
        assert_eq!(gop_length_for(60, 1), 15);
        assert_eq!(gop_length_for(30, 1), 30);
        assert_eq!(gop_length_for(24, 1), 60);
        assert_eq!(gop_length_for(30000, 1001), 60);
        assert_eq!(gop_length_for(0, 0), 15);
    }

    #[test]
    fn zero_frame_rate_is_rejected() {
        assert!(SessionParams::new(0, 1, 1).validate().is_err());
        assert!(SessionParams::new(30, 0, 1).validate().is_err());
        assert!(SessionParams::new(30, 1, 0).validate().is_ok());
    }

    #[test]
    fn build_negotiates_aligned_geometry_and_encoder_config() {
        let mut fx = fixture(SimDevices::with_screen(1366, 768));
        let info = fx.session.build(SessionParams::new(60, 1, 4_000_000)).unwrap();
        assert_eq!(info.size, FrameSize::new(1368, 768));
        assert_eq!(info.screen, FrameSize::new(1366, 768));
        assert_eq!(info.gop_length, 15);

        let report = fx.devices.report();
        let capture = &report.session_params[0];
        assert!(!capture.with_cursor);
        assert!(capture.push_model);
        assert!(capture.allow_direct_capture);
        assert_eq!(capture.sampling_rate_ms, 16);

        let init = &report.init_params[0];
        assert_eq!(init.size, FrameSize::new(1368, 768));
        let config = init.encode_config.as_ref().unwrap();
        assert_eq!(config.profile, Profile::High);
        assert_eq!(config.rc.average_bitrate, 4_000_000);
        assert_eq!(config.rc.max_bitrate, 4_000_000);
        assert!(config.rc.zero_reorder_delay);
        assert_eq!(config.h264.idr_period, 15);
        assert_eq!(config.h264.vui.num_units_in_tick, 1);
        assert_eq!(config.h264.vui.time_scale, 120);
        assert!(config.h264.output_aud);
        assert!(!config.h264.repeat_sps_pps);

        assert_eq!(report.count(SimOp::RegisterResource), 2);
        assert_eq!(report.count(SimOp::CreateBitstreamBuffer), 1);
        assert!(fx.finish().is_clean());
    }

    #[test]
    fn pointer_request_never_reaches_capture_session() {
        let mut fx = fixture(SimDevices::default());
        fx.session
            .build(SessionParams::new(30, 1, 1_000_000).with_pointer(true))
            .unwrap();
        assert!(!fx.devices.report().session_params[0].with_cursor);
        assert!(fx.finish().is_clean());
    }

    #[test]
    fn teardown_mirrors_build_order_and_releases_everything() {
        let mut fx = fixture(SimDevices::default());
        fx.session.build(SessionParams::new(30, 1, 1_000_000)).unwrap();
        let mark = fx.devices.report().log.len();
        fx.session.teardown().unwrap();
        assert!(!fx.session.is_built());

        let report = fx.devices.report();
        let tail = &report.log[mark..];
        assert_eq!(
            tail,
            &[
                SimOp::DestroyBitstreamBuffer,
                SimOp::UnregisterResource,
                SimOp::UnregisterResource,
                SimOp::DestroyEncoder,
                SimOp::DestroyCaptureSession,
                SimOp::DestroyCaptureHandle,
            ]
        );

        // Idempotent.
        fx.session.teardown().unwrap();
        assert_eq!(fx.devices.report().log.len(), report.log.len());

        assert!(fx.finish().is_clean());
    }

    #[test]
    fn failed_build_tears_down_partial_session() {
        let devices = SimDevices::default();
        devices.fail_next(SimOp::CreateBitstreamBuffer, 10);
        let mut fx = fixture(devices);

        let err = fx.session.build(SessionParams::new(30, 1, 1_000_000)).unwrap_err();
        assert!(matches!(err, NvcapError::Device { op: "create_bitstream_buffer", status: 10 }));
        assert!(!fx.session.is_built());
        assert_eq!(fx.session.generation(), 0);

        let report = fx.devices.report();
        assert_eq!(report.count(SimOp::UnregisterResource), 2);
        assert_eq!(report.count(SimOp::DestroyEncoder), 1);
        assert_eq!(report.count(SimOp::DestroyCaptureSession), 1);
        assert_eq!(report.count(SimOp::DestroyCaptureHandle), 1);
        let report = fx.finish();
        assert_eq!(report.live.get(&Resource::Encoder), None);
        assert!(report.is_clean());
    }

    #[test]
    fn teardown_continues_past_failures_and_reports_first() {
        let devices = SimDevices::default();
        let mut fx = fixture(devices.clone());
        fx.session.build(SessionParams::new(30, 1, 1_000_000)).unwrap();

        devices.fail_next(SimOp::DestroyBitstreamBuffer, 3);
        devices.fail_next(SimOp::DestroyCaptureHandle, 4);
        let err = fx.session.teardown().unwrap_err();
        assert!(matches!(err, NvcapError::Device { op: "destroy_bitstream_buffer", status: 3 }));

        let report = devices.report();
        assert_eq!(report.count(SimOp::UnregisterResource), 2);
        assert_eq!(report.count(SimOp::DestroyEncoder), 1);
        assert_eq!(report.count(SimOp::DestroyCaptureSession), 1);
        assert!(!fx.session.is_built());
        assert!(fx.session.info().is_none());
    }

    #[test]
    fn capture_handle_destroy_failure_is_not_reported() {
        let devices = SimDevices::default();
        let mut fx = fixture(devices.clone());
        fx.session.build(SessionParams::new(30, 1, 1_000_000)).unwrap();
        devices.fail_next(SimOp::DestroyCaptureHandle, 4);
        assert!(fx.session.teardown().is_ok());
    }

    #[test]
    fn single_texture_registers_single_input() {
        let devices = SimDevices::new(nvcap_device_sim::SimConfig {
            textures: 1,
            ..Default::default()
        });
        let mut fx = fixture(devices);
        fx.session.build(SessionParams::new(30, 1, 1_000_000)).unwrap();
        assert_eq!(fx.devices.report().count(SimOp::RegisterResource), 1);
        assert!(fx.session.map_slot(1).is_err());
        assert!(fx.finish().is_clean());
    }

    proptest! {
        #[test]
        fn gop_is_one_of_three_buckets(fps_n in 1u32..=240, fps_d in 1u32..=4) {
            let gop = gop_length_for(fps_n, fps_d);
            prop_assert!(gop == 15 || gop == 30 || gop == 60);
            if fps_n / fps_d >= 60 {
                prop_assert_eq!(gop, 15);
            }
        }
    }
}
