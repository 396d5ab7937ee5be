//! Synthetic H.264 Annex-B access units.
//!
//! The payload is not decodable video. It has the NAL structure a real
//! low-latency encoder emits (access unit delimiter, parameter sets on IDR,
//! one slice) so that anything splitting on start codes sees sane units.

const START_CODE: [u8; 4] = [0, 0, 0, 1];

const NAL_AUD: u8 = 0x09;
const NAL_SPS: u8 = 0x67;
const NAL_PPS: u8 = 0x68;
const NAL_IDR_SLICE: u8 = 0x65;
const NAL_SLICE: u8 = 0x41;

/// Filler byte; avoids forming emulation-prevention sequences.
const FILLER: u8 = 0xAA;

const MIN_PAYLOAD: usize = 16;
const MAX_PAYLOAD: usize = 64 * 1024;

/// Build one access unit of roughly `payload_hint` slice bytes.
///
/// The slice carries the frame index in ASCII so tests can tell frames
/// apart.
pub fn synthesize_picture(frame_idx: u64, keyframe: bool, payload_hint: usize) -> Vec<u8> {
    let payload = payload_hint.clamp(MIN_PAYLOAD, MAX_PAYLOAD);
    let mut out = Vec::with_capacity(payload + 32);

    out.extend_from_slice(&START_CODE);
    out.extend_from_slice(&[NAL_AUD, 0xF0]);

    if keyframe {
        out.extend_from_slice(&START_CODE);
        out.extend_from_slice(&[NAL_SPS, 0x64, 0x00, 0x28]);
        out.extend_from_slice(&START_CODE);
        out.extend_from_slice(&[NAL_PPS, 0xEE, 0x3C, 0x80]);
    }

    out.extend_from_slice(&START_CODE);
    out.push(if keyframe { NAL_IDR_SLICE } else { NAL_SLICE });
    let marker = frame_idx.to_string();
    out.extend_from_slice(marker.as_bytes());
    out.resize(out.len() + payload.saturating_sub(marker.len()), FILLER);
    out
}

/// Slice size for a frame at the given rate; keyframes are three times
/// larger.
pub(crate) fn payload_hint(bitrate: u32, fps_n: u32, fps_d: u32, keyframe: bool) -> usize {
    let fps = if fps_d == 0 { 0 } else { fps_n / fps_d };
    let per_frame = (bitrate / 8 / fps.max(1)) as usize;
    if keyframe {
        per_frame.saturating_mul(3)
    } else {
        per_frame
    }
}

/// NAL unit types present in an Annex-B buffer, in order.
#[cfg(test)]
pub(crate) fn nal_types(data: &[u8]) -> Vec<u8> {
    data.windows(5)
        .filter(|window| window[..4] == START_CODE)
        .map(|window| window[4] & 0x1F)
        .collect()
}
