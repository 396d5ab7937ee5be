use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use nvcap_common::error::NvcapResult;
use nvcap_device_core::{
    BitstreamBuffer, Codec, DeviceType, EncodeConfig, EncoderApi, EncoderHandle,
    EncoderInitParams, GlBinding, LockedBitstream, MappedInput, MappedResource, PicParams,
    PictureType, Preset, RegisterResource, RegisteredResource,
};

use crate::bitstream::{payload_hint, synthesize_picture};
use crate::lock_state;
use crate::state::{Resource, SimOp, SimState};

struct EncodedPicture {
    data: Vec<u8>,
    picture_type: PictureType,
    timestamp_ns: u64,
}

#[derive(Default)]
struct EncodeSession {
    init: Option<EncoderInitParams>,
    registered: HashMap<u64, RegisterResource>,
    /// Mapped id to registered id.
    mapped: HashMap<u64, u64>,
    buffers: HashMap<u64, Option<EncodedPicture>>,
    locked: Option<u64>,
    frames_since_idr: Option<u32>,
}

impl EncodeSession {
    fn idr_period(&self) -> u32 {
        self.init
            .as_ref()
            .and_then(|init| init.encode_config.as_ref())
            .map_or(EncodeConfig::default().h264.idr_period, |config| config.h264.idr_period)
    }

    fn needs_idr(&self, forced: bool) -> bool {
        let period = self.idr_period();
        match self.frames_since_idr {
            None => true,
            Some(_) if forced => true,
            Some(count) => period != 0 && count >= period,
        }
    }
}

pub(crate) struct SimEncoder {
    state: Arc<Mutex<SimState>>,
    sessions: HashMap<u64, EncodeSession>,
    /// Copy of the locked buffer handed out by `lock_bitstream`.
    locked_data: Vec<u8>,
}

impl SimEncoder {
    pub fn new(state: Arc<Mutex<SimState>>) -> Self {
        Self {
            state,
            sessions: HashMap::new(),
            locked_data: Vec::new(),
        }
    }
}

impl EncoderApi for SimEncoder {
    fn open_session(&mut self, device: DeviceType, binding: GlBinding) -> NvcapResult<EncoderHandle> {
        let mut state = lock_state(&self.state);
        state.enter(SimOp::OpenEncodeSession)?;
        if device != DeviceType::OpenGl || !state.is_live(Resource::Context, binding.context.0) {
            return Err(state.invalid(SimOp::OpenEncodeSession));
        }
        let id = state.acquire(Resource::Encoder);
        self.sessions.insert(id, EncodeSession::default());
        Ok(EncoderHandle(id))
    }

    fn preset_config(
        &mut self,
        encoder: EncoderHandle,
        codec: Codec,
        _preset: Preset,
    ) -> NvcapResult<EncodeConfig> {
        let mut state = lock_state(&self.state);
        state.enter(SimOp::PresetConfig)?;
        if !self.sessions.contains_key(&encoder.0) || codec != Codec::H264 {
            return Err(state.invalid(SimOp::PresetConfig));
        }
        Ok(EncodeConfig::default())
    }

    fn initialize(&mut self, encoder: EncoderHandle, params: &EncoderInitParams) -> NvcapResult<()> {
        let mut state = lock_state(&self.state);
        state.enter(SimOp::InitializeEncoder)?;
        let Some(session) = self.sessions.get_mut(&encoder.0) else {
            return Err(state.invalid(SimOp::InitializeEncoder));
        };
        if session.init.is_some()
            || params.size.is_empty()
            || params.frame_rate_num == 0
            || params.frame_rate_den == 0
        {
            return Err(state.invalid(SimOp::InitializeEncoder));
        }
        state.init_params.push(params.clone());
        session.init = Some(params.clone());
        Ok(())
    }

    fn register_resource(
        &mut self,
        encoder: EncoderHandle,
        resource: &RegisterResource,
    ) -> NvcapResult<RegisteredResource> {
        let mut state = lock_state(&self.state);
        state.enter(SimOp::RegisterResource)?;
        let Some(session) = self.sessions.get_mut(&encoder.0).filter(|s| s.init.is_some()) else {
            return Err(state.invalid(SimOp::RegisterResource));
        };
        if resource.texture == 0 || resource.pitch < resource.size.width {
            return Err(state.invalid(SimOp::RegisterResource));
        }
        let id = state.acquire(Resource::Registered);
        session.registered.insert(id, *resource);
        Ok(RegisteredResource(id))
    }

    fn unregister_resource(
        &mut self,
        encoder: EncoderHandle,
        resource: RegisteredResource,
    ) -> NvcapResult<()> {
        let mut state = lock_state(&self.state);
        state.enter(SimOp::UnregisterResource)?;
        let Some(session) = self.sessions.get_mut(&encoder.0) else {
            return Err(state.invalid(SimOp::UnregisterResource));
        };
        let still_mapped = session.mapped.values().any(|reg| *reg == resource.0);
        if still_mapped || session.registered.remove(&resource.0).is_none() {
            return Err(state.invalid(SimOp::UnregisterResource));
        }
        state.release(Resource::Registered, resource.0);
        Ok(())
    }

    fn create_bitstream_buffer(&mut self, encoder: EncoderHandle) -> NvcapResult<BitstreamBuffer> {
        let mut state = lock_state(&self.state);
        state.enter(SimOp::CreateBitstreamBuffer)?;
        let Some(session) = self.sessions.get_mut(&encoder.0).filter(|s| s.init.is_some()) else {
            return Err(state.invalid(SimOp::CreateBitstreamBuffer));
        };
        let id = state.acquire(Resource::Bitstream);
        session.buffers.insert(id, None);
        Ok(BitstreamBuffer(id))
    }

    fn destroy_bitstream_buffer(
        &mut self,
        encoder: EncoderHandle,
        buffer: BitstreamBuffer,
    ) -> NvcapResult<()> {
        let mut state = lock_state(&self.state);
        state.enter(SimOp::DestroyBitstreamBuffer)?;
        let Some(session) = self.sessions.get_mut(&encoder.0) else {
            return Err(state.invalid(SimOp::DestroyBitstreamBuffer));
        };
        if session.locked == Some(buffer.0) || session.buffers.remove(&buffer.0).is_none() {
            return Err(state.invalid(SimOp::DestroyBitstreamBuffer));
        }
        state.release(Resource::Bitstream, buffer.0);
        Ok(())
    }

    fn map_input(
        &mut self,
        encoder: EncoderHandle,
        resource: RegisteredResource,
    ) -> NvcapResult<MappedInput> {
        let mut state = lock_state(&self.state);
        state.enter(SimOp::MapInput)?;
        let Some(session) = self.sessions.get_mut(&encoder.0) else {
            return Err(state.invalid(SimOp::MapInput));
        };
        let Some(registered) = session.registered.get(&resource.0) else {
            return Err(state.invalid(SimOp::MapInput));
        };
        if session.mapped.values().any(|reg| *reg == resource.0) {
            return Err(state.invalid(SimOp::MapInput));
        }
        let format = registered.format;
        let id = state.acquire(Resource::Mapped);
        session.mapped.insert(id, resource.0);
        Ok(MappedInput {
            resource: MappedResource(id),
            format,
        })
    }

    fn unmap_input(&mut self, encoder: EncoderHandle, mapped: MappedResource) -> NvcapResult<()> {
        let mut state = lock_state(&self.state);
        state.enter(SimOp::UnmapInput)?;
        let removed = self
            .sessions
            .get_mut(&encoder.0)
            .and_then(|session| session.mapped.remove(&mapped.0));
        if removed.is_none() {
            return Err(state.invalid(SimOp::UnmapInput));
        }
        state.release(Resource::Mapped, mapped.0);
        Ok(())
    }

    fn encode_picture(&mut self, encoder: EncoderHandle, params: &PicParams) -> NvcapResult<()> {
        let mut state = lock_state(&self.state);
        state.enter(SimOp::EncodePicture)?;
        let Some(session) = self.sessions.get_mut(&encoder.0) else {
            return Err(state.invalid(SimOp::EncodePicture));
        };
        let Some(init) = session.init.clone() else {
            return Err(state.invalid(SimOp::EncodePicture));
        };
        // An unread picture may be overwritten; a locked one may not.
        let output_free = session.buffers.contains_key(&params.output.0)
            && session.locked != Some(params.output.0);
        if !session.mapped.contains_key(&params.input.0)
            || !output_free
            || params.pitch < params.width
            || params.width != init.size.width
            || params.height != init.size.height
        {
            return Err(state.invalid(SimOp::EncodePicture));
        }
        state.pictures.push(*params);

        let keyframe = session.needs_idr(params.force_idr);
        session.frames_since_idr = Some(match session.frames_since_idr {
            Some(count) if !keyframe => count + 1,
            _ => 1,
        });

        let bitrate = init
            .encode_config
            .as_ref()
            .map_or(0, |config| config.rc.average_bitrate);
        let hint = payload_hint(bitrate, init.frame_rate_num, init.frame_rate_den, keyframe);
        let picture = EncodedPicture {
            data: synthesize_picture(params.frame_idx, keyframe, hint),
            picture_type: if keyframe { PictureType::Idr } else { PictureType::P },
            timestamp_ns: params.input_timestamp_ns,
        };
        session.buffers.insert(params.output.0, Some(picture));
        Ok(())
    }

    fn lock_bitstream(
        &mut self,
        encoder: EncoderHandle,
        buffer: BitstreamBuffer,
    ) -> NvcapResult<LockedBitstream<'_>> {
        let (picture_type, timestamp_ns) = {
            let mut state = lock_state(&self.state);
            state.enter(SimOp::LockBitstream)?;
            let Some(session) = self.sessions.get_mut(&encoder.0) else {
                return Err(state.invalid(SimOp::LockBitstream));
            };
            if session.locked.is_some() {
                return Err(state.invalid(SimOp::LockBitstream));
            }
            let Some(Some(picture)) = session.buffers.get(&buffer.0) else {
                return Err(state.invalid(SimOp::LockBitstream));
            };
            self.locked_data.clear();
            self.locked_data.extend_from_slice(&picture.data);
            let meta = (picture.picture_type, picture.timestamp_ns);
            session.locked = Some(buffer.0);
            meta
        };

        Ok(LockedBitstream {
            data: &self.locked_data,
            picture_type,
            timestamp_ns,
        })
    }

    fn unlock_bitstream(&mut self, encoder: EncoderHandle, buffer: BitstreamBuffer) -> NvcapResult<()> {
        let mut state = lock_state(&self.state);
        state.enter(SimOp::UnlockBitstream)?;
        let Some(session) = self
            .sessions
            .get_mut(&encoder.0)
            .filter(|s| s.locked == Some(buffer.0))
        else {
            return Err(state.invalid(SimOp::UnlockBitstream));
        };
        session.locked = None;
        session.buffers.insert(buffer.0, None);
        self.locked_data.clear();
        Ok(())
    }

    fn destroy_encoder(&mut self, encoder: EncoderHandle) -> NvcapResult<()> {
        let mut state = lock_state(&self.state);
        state.enter(SimOp::DestroyEncoder)?;
        let Some(session) = self.sessions.get(&encoder.0) else {
            return Err(state.invalid(SimOp::DestroyEncoder));
        };
        if !session.registered.is_empty() || !session.buffers.is_empty() || !session.mapped.is_empty()
        {
            tracing::warn!(encoder = encoder.0, "Encoder destroyed with live resources");
            return Err(state.invalid(SimOp::DestroyEncoder));
        }
        self.sessions.remove(&encoder.0);
        state.release(Resource::Encoder, encoder.0);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitstream::nal_types;
    use crate::SimDevices;
    use nvcap_device_core::{
        BufferFormat, DeviceFactory, FbConfig, FrameSize, GlContext, PictureStruct,
    };

    struct Fixture {
        devices: SimDevices,
        encoder: Box<dyn EncoderApi>,
        handle: EncoderHandle,
        registered: RegisteredResource,
        output: BitstreamBuffer,
    }

    fn fixture(idr_period: u32) -> Fixture {
        let devices = SimDevices::default();
        let context = lock_state(&devices.state).acquire(Resource::Context);
        let binding = GlBinding {
            context: GlContext(context),
            fb_config: FbConfig(0x21),
        };
        let mut encoder = devices.encoder().unwrap();
        let handle = encoder.open_session(DeviceType::OpenGl, binding).unwrap();
        let config = encoder
            .preset_config(handle, Codec::H264, Preset::LowLatencyDefault)
            .unwrap()
            .with_gop_length(idr_period);
        let size = FrameSize::new(64, 32);
        let init = EncoderInitParams::new(Codec::H264, size, BufferFormat::Nv12)
            .with_encode_config(config);
        encoder.initialize(handle, &init).unwrap();
        let registered = encoder
            .register_resource(
                handle,
                &RegisterResource {
                    texture: 17,
                    target: 0x0DE1,
                    size,
                    pitch: 64,
                    format: BufferFormat::Nv12,
                },
            )
            .unwrap();
        let output = encoder.create_bitstream_buffer(handle).unwrap();
        Fixture {
            devices,
            encoder,
            handle,
            registered,
            output,
        }
    }

    fn encode(fx: &mut Fixture, frame_idx: u64, force_idr: bool) -> (PictureType, Vec<u8>) {
        let mapped = fx.encoder.map_input(fx.handle, fx.registered).unwrap();
        let params = PicParams {
            input: mapped.resource,
            format: mapped.format,
            width: 64,
            height: 32,
            pitch: 64,
            picture_struct: PictureStruct::Frame,
            frame_idx,
            input_duration_ns: 1,
            input_timestamp_ns: frame_idx,
            force_idr,
            output: fx.output,
        };
        fx.encoder.encode_picture(fx.handle, &params).unwrap();
        let locked = fx.encoder.lock_bitstream(fx.handle, fx.output).unwrap();
        let result = (locked.picture_type, locked.data.to_vec());
        fx.encoder.unlock_bitstream(fx.handle, fx.output).unwrap();
        fx.encoder.unmap_input(fx.handle, mapped.resource).unwrap();
        result
    }

    #[test]
    fn idr_follows_period_and_force_flag() {
        let mut fx = fixture(3);
        let types: Vec<_> = (0..7).map(|i| encode(&mut fx, i, i == 4).0).collect();
        use PictureType::{Idr, P};
        assert_eq!(types, vec![Idr, P, P, Idr, Idr, P, P]);
    }

    #[test]
    fn idr_picture_has_parameter_sets() {
        let mut fx = fixture(30);
        let (_, data) = encode(&mut fx, 0, false);
        assert_eq!(nal_types(&data), vec![9, 7, 8, 5]);
        let (_, data) = encode(&mut fx, 1, false);
        assert_eq!(nal_types(&data), vec![9, 1]);
    }

    #[test]
    fn destroy_with_live_resources_is_rejected() {
        let mut fx = fixture(30);
        assert!(fx.encoder.destroy_encoder(fx.handle).is_err());

        fx.encoder.destroy_bitstream_buffer(fx.handle, fx.output).unwrap();
        fx.encoder.unregister_resource(fx.handle, fx.registered).unwrap();
        fx.encoder.destroy_encoder(fx.handle).unwrap();

        let report = fx.devices.report();
        assert_eq!(report.live.get(&Resource::Encoder), None);
        assert_eq!(report.count(SimOp::DestroyEncoder), 2);
    }

    #[test]
    fn unregister_while_mapped_is_rejected() {
        let mut fx = fixture(30);
        let mapped = fx.encoder.map_input(fx.handle, fx.registered).unwrap();
        assert!(fx.encoder.unregister_resource(fx.handle, fx.registered).is_err());
        fx.encoder.unmap_input(fx.handle, mapped.resource).unwrap();
        fx.encoder.unregister_resource(fx.handle, fx.registered).unwrap();
    }

    #[test]
    fn encode_into_locked_output_is_rejected() {
        let mut fx = fixture(30);
        encode(&mut fx, 0, false);
        let mapped = fx.encoder.map_input(fx.handle, fx.registered).unwrap();
        let params = PicParams {
            input: mapped.resource,
            format: mapped.format,
            width: 64,
            height: 32,
            pitch: 64,
            picture_struct: PictureStruct::Frame,
            frame_idx: 1,
            input_duration_ns: 1,
            input_timestamp_ns: 1,
            force_idr: false,
            output: fx.output,
        };
        fx.encoder.encode_picture(fx.handle, &params).unwrap();
        fx.encoder.lock_bitstream(fx.handle, fx.output).unwrap();
        assert!(fx.encoder.encode_picture(fx.handle, &params).is_err());
        assert!(fx.encoder.destroy_bitstream_buffer(fx.handle, fx.output).is_err());

        fx.encoder.unlock_bitstream(fx.handle, fx.output).unwrap();
        // An unread picture can be overwritten.
        fx.encoder.encode_picture(fx.handle, &params).unwrap();
        fx.encoder.unmap_input(fx.handle, mapped.resource).unwrap();
    }

    #[test]
    fn lock_without_encode_is_rejected() {
        let mut fx = fixture(30);
        assert!(fx.encoder.lock_bitstream(fx.handle, fx.output).is_err());
    }
}
