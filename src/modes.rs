//! Camera mode enumeration from UVC format descriptors.

use tracing::debug;

use crate::traits::{
    CameraMode, DescriptorSubtype, FormatDescriptor, FourCC, FrameFormat, PixelFormat,
};

/// Frame intervals are expressed in 100 ns units.
pub const INTERVALS_PER_SECOND: u32 = 10_000_000;

/// Host pixel format for a descriptor four-character code.
#[must_use]
pub fn pixel_format_for(fourcc: FourCC) -> PixelFormat {
    if fourcc == FourCC::YUY2 {
        PixelFormat::Yuyv
    } else {
        PixelFormat::Unknown
    }
}

/// Transport frame format for a host pixel format.
#[must_use]
pub const fn frame_format_for(format: PixelFormat) -> FrameFormat {
    match format {
        PixelFormat::Yuyv => FrameFormat::Yuyv,
        _ => FrameFormat::Unknown,
    }
}

/// Host pixel format for a transport frame format.
#[must_use]
pub const fn pixel_format_from_frame(format: FrameFormat) -> PixelFormat {
    match format {
        FrameFormat::Yuyv => PixelFormat::Yuyv,
        _ => PixelFormat::Unknown,
    }
}

/// Build the mode list for a device.
///
/// Only uncompressed formats with a known pixel format are kept. Each frame
/// descriptor yields one mode at its first reported interval; the list keeps
/// descriptor order and duplicates.
#[must_use]
pub fn enumerate(descriptors: &[FormatDescriptor]) -> Vec<CameraMode> {
    let mut modes = Vec::new();

    for descriptor in descriptors {
        if descriptor.subtype != DescriptorSubtype::FormatUncompressed {
            debug!(subtype = ?descriptor.subtype, "skipping non-uncompressed format");
            continue;
        }

        let format = pixel_format_for(descriptor.fourcc);
        if format == PixelFormat::Unknown {
            debug!(fourcc = %descriptor.fourcc, "skipping unsupported pixel format");
            continue;
        }

        for frame in &descriptor.frames {
            if frame.subtype != DescriptorSubtype::FrameUncompressed {
                continue;
            }

            let Some(&interval) = frame.intervals.first().filter(|&&i| i != 0) else {
                debug!(
                    width = frame.width,
                    height = frame.height,
                    "skipping frame size without a usable interval"
                );
                continue;
            };

            let mode = CameraMode::new(
                u32::from(frame.width),
                u32::from(frame.height),
                INTERVALS_PER_SECOND / interval,
                format,
            );
            debug!(
                width = mode.width,
                height = mode.height,
                fps = mode.fps,
                "supported camera mode"
            );
            modes.push(mode);
        }
    }

    modes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::FrameDescriptor;

    fn frame(width: u16, height: u16, intervals: &[u32]) -> FrameDescriptor {
        FrameDescriptor {
            subtype: DescriptorSubtype::FrameUncompressed,
            width,
            height,
            intervals: intervals.to_vec(),
        }
    }

    fn yuy2(frames: Vec<FrameDescriptor>) -> FormatDescriptor {
        FormatDescriptor {
            subtype: DescriptorSubtype::FormatUncompressed,
            fourcc: FourCC::YUY2,
            frames,
        }
    }

    #[test]
    fn test_first_interval_sets_fps() {
        let modes = enumerate(&[yuy2(vec![frame(640, 480, &[333_333, 666_666])])]);

        assert_eq!(modes, vec![CameraMode::new(640, 480, 30, PixelFormat::Yuyv)]);
    }

    #[test]
    fn test_descriptor_order_and_duplicates_kept() {
        let modes = enumerate(&[yuy2(vec![
            frame(1280, 720, &[1_000_000]),
            frame(640, 480, &[333_333]),
            frame(1280, 720, &[1_000_000]),
        ])]);

        let sizes: Vec<_> = modes.iter().map(|m| (m.width, m.height, m.fps)).collect();
        assert_eq!(sizes, vec![(1280, 720, 10), (640, 480, 30), (1280, 720, 10)]);
    }

    #[test]
    fn test_compressed_and_unknown_formats_skipped() {
        let mjpeg = FormatDescriptor {
            subtype: DescriptorSubtype::FormatMjpeg,
            fourcc: FourCC::MJPG,
            frames: vec![FrameDescriptor {
                subtype: DescriptorSubtype::FrameMjpeg,
                width: 1920,
                height: 1080,
                intervals: vec![333_333],
            }],
        };
        let nv12 = FormatDescriptor {
            subtype: DescriptorSubtype::FormatUncompressed,
            fourcc: FourCC::new(b"NV12"),
            frames: vec![frame(640, 480, &[333_333])],
        };

        assert!(enumerate(&[mjpeg, nv12]).is_empty());
    }

    #[test]
    fn test_frames_without_interval_skipped() {
        let modes = enumerate(&[yuy2(vec![
            frame(320, 240, &[]),
            frame(352, 288, &[0]),
            frame(160, 120, &[666_666]),
        ])]);

        assert_eq!(modes, vec![CameraMode::new(160, 120, 15, PixelFormat::Yuyv)]);
    }

    #[test]
    fn test_format_mapping() {
        assert_eq!(frame_format_for(PixelFormat::Yuyv), FrameFormat::Yuyv);
        assert_eq!(frame_format_for(PixelFormat::Nv21), FrameFormat::Unknown);
        assert_eq!(pixel_format_from_frame(FrameFormat::Mjpeg), PixelFormat::Unknown);
        assert_eq!(pixel_format_for(FourCC::YUYV), PixelFormat::Unknown);
    }
}
