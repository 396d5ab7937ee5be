//! Hardware encoder contract.

use nvcap_common::error::NvcapResult;

use crate::config::{BufferFormat, Codec, EncodeConfig, EncoderInitParams, Preset};
use crate::graphics::GlBinding;
use crate::handle::{BitstreamBuffer, EncoderHandle, FrameSize, MappedResource, RegisteredResource};

/// Kind of device an encoder session is opened against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceType {
    OpenGl,
}

/// A capture texture to register as encoder input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterResource {
    pub texture: u32,
    pub target: u32,
    pub size: FrameSize,
    pub pitch: u32,
    pub format: BufferFormat,
}

/// A registered resource mapped for encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappedInput {
    pub resource: MappedResource,
    pub format: BufferFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PictureStruct {
    #[default]
    Frame,
}

/// Per-picture encode parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PicParams {
    pub input: MappedResource,
    pub format: BufferFormat,
    pub width: u32,
    pub height: u32,
    pub pitch: u32,
    pub picture_struct: PictureStruct,
    pub frame_idx: u64,
    pub input_duration_ns: u64,
    pub input_timestamp_ns: u64,
    /// Force an IDR picture with fresh parameter sets.
    pub force_idr: bool,
    pub output: BitstreamBuffer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PictureType {
    Idr,
    I,
    P,
    B,
    Unknown,
}

impl PictureType {
    /// Whether a decoder can start from this picture.
    pub fn is_keyframe(self) -> bool {
        matches!(self, Self::Idr | Self::I)
    }
}

/// A locked output buffer. The data is only valid until the matching
/// [`EncoderApi::unlock_bitstream`].
#[derive(Debug)]
pub struct LockedBitstream<'a> {
    pub data: &'a [u8],
    pub picture_type: PictureType,
    pub timestamp_ns: u64,
}

/// Encoder session operations.
pub trait EncoderApi {
    fn open_session(&mut self, device: DeviceType, binding: GlBinding)
        -> NvcapResult<EncoderHandle>;

    fn preset_config(
        &mut self,
        encoder: EncoderHandle,
        codec: Codec,
        preset: Preset,
    ) -> NvcapResult<EncodeConfig>;

    fn initialize(&mut self, encoder: EncoderHandle, params: &EncoderInitParams)
        -> NvcapResult<()>;

    fn register_resource(
        &mut self,
        encoder: EncoderHandle,
        resource: &RegisterResource,
    ) -> NvcapResult<RegisteredResource>;

    fn unregister_resource(
        &mut self,
        encoder: EncoderHandle,
        resource: RegisteredResource,
    ) -> NvcapResult<()>;

    fn create_bitstream_buffer(&mut self, encoder: EncoderHandle) -> NvcapResult<BitstreamBuffer>;

    fn destroy_bitstream_buffer(
        &mut self,
        encoder: EncoderHandle,
        buffer: BitstreamBuffer,
    ) -> NvcapResult<()>;

    fn map_input(
        &mut self,
        encoder: EncoderHandle,
        resource: RegisteredResource,
    ) -> NvcapResult<MappedInput>;

    fn unmap_input(&mut self, encoder: EncoderHandle, mapped: MappedResource) -> NvcapResult<()>;

    fn encode_picture(&mut self, encoder: EncoderHandle, params: &PicParams) -> NvcapResult<()>;

    fn lock_bitstream(
        &mut self,
        encoder: EncoderHandle,
        buffer: BitstreamBuffer,
    ) -> NvcapResult<LockedBitstream<'_>>;

    fn unlock_bitstream(&mut self, encoder: EncoderHandle, buffer: BitstreamBuffer)
        -> NvcapResult<()>;

    fn destroy_encoder(&mut self, encoder: EncoderHandle) -> NvcapResult<()>;
}
