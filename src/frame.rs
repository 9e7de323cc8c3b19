//! Per-frame metadata assembly and delivery.
#![allow(unsafe_code)]

use tracing::{error, warn};

use crate::controls::exposure_to_ns;
use crate::modes::pixel_format_from_frame;
use crate::traits::{
    CameraFrame, CameraIntrinsics, ExposureProbe, FrameCallback, RawFrame, SharedSink,
};

/// Current `CLOCK_MONOTONIC` time in nanoseconds.
#[must_use]
pub fn monotonic_now_ns() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: `ts` is a valid, writable timespec.
    let rc = unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    if rc != 0 {
        return 0;
    }
    let secs = u64::try_from(ts.tv_sec).unwrap_or(0);
    let nanos = u64::try_from(ts.tv_nsec).unwrap_or(0);
    secs.saturating_mul(1_000_000_000).saturating_add(nanos)
}

/// Build the host frame for a transport frame.
#[must_use]
pub const fn assemble<'a>(
    raw: &RawFrame<'a>,
    timestamp: u64,
    exposure_time: u64,
    intrinsics: CameraIntrinsics,
) -> CameraFrame<'a> {
    CameraFrame {
        timestamp,
        exposure_time,
        buffer: raw.data,
        index: raw.sequence,
        width: raw.width,
        height: raw.height,
        stride: raw.step,
        format: pixel_format_from_frame(raw.format),
        intrinsics,
    }
}

/// The closure a transport runs for every frame of a stream.
///
/// Intrinsics are fixed for the stream; exposure is read live through
/// `probe`. Frames arriving without a sink are dropped.
#[must_use]
pub fn delivery(
    sink: Option<SharedSink>,
    intrinsics: CameraIntrinsics,
    probe: ExposureProbe,
) -> FrameCallback {
    Box::new(move |raw: &RawFrame<'_>| {
        let Some(sink) = sink.as_ref() else {
            error!(sequence = raw.sequence, "no frame sink registered, dropping frame");
            return;
        };

        let timestamp = monotonic_now_ns();
        let exposure_time = match probe() {
            Ok(value) => exposure_to_ns(value),
            Err(err) => {
                warn!(%err, "failed to read exposure for frame");
                0
            }
        };

        sink.on_new_camera_frame(&assemble(raw, timestamp, exposure_time, intrinsics));
    })
}
