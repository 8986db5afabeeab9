//! Kernel mode handling: refresh calculation and custom mode synthesis.

use drm::control::{Mode as KernelMode, ModeFlags, ModeTypeFlags};

use crate::output::Mode;

/// Vertical refresh rate of a kernel mode in mHz.
///
/// The `vrefresh` field of the kernel struct only has Hz resolution, so the
/// rate is recomputed from the pixel clock and blanking like the kernel
/// itself does.
pub(crate) fn refresh_rate(mode: &KernelMode) -> i32 {
    let htotal = mode.hsync().2 as u64;
    let vtotal = mode.vsync().2 as u64;
    if htotal == 0 || vtotal == 0 {
        return 0;
    }

    let mut refresh = (mode.clock() as u64 * 1_000_000 / htotal + vtotal / 2) / vtotal;

    let flags = mode.flags();
    if flags.contains(ModeFlags::INTERLACE) {
        refresh *= 2;
    }
    if flags.contains(ModeFlags::DBLSCAN) {
        refresh /= 2;
    }
    if mode.vscan() > 1 {
        refresh /= mode.vscan() as u64;
    }

    refresh as i32
}

/// Translate a kernel mode into the backend-independent [`Mode`].
pub(crate) fn mode_info(mode: &KernelMode) -> Mode {
    let (w, h) = mode.size();
    Mode {
        size: (w as i32, h as i32),
        refresh: refresh_rate(mode),
        preferred: mode.mode_type().contains(ModeTypeFlags::PREFERRED),
    }
}

const DRM_MODE_TYPE_USERDEF: u32 = 1 << 5;
const DRM_MODE_FLAG_PHSYNC: u32 = 1 << 0;
const DRM_MODE_FLAG_NVSYNC: u32 = 1 << 3;

// CVT 1.2 reduced blanking timing constants
const RB_H_FRONT_PORCH: u32 = 48;
const RB_H_SYNC: u32 = 32;
const RB_H_BLANK: u32 = 160;
const RB_MIN_V_BLANK_US: f64 = 460.0;
const RB_V_FRONT_PORCH: u32 = 3;
const MIN_V_BACK_PORCH: u32 = 6;
const CLOCK_STEP_KHZ: u32 = 250;

fn cvt_vsync_width(hdisplay: u32, vdisplay: u32) -> u32 {
    // sync width encodes the aspect ratio
    if vdisplay * 4 == hdisplay * 3 {
        4
    } else if vdisplay * 16 == hdisplay * 9 {
        5
    } else if vdisplay * 16 == hdisplay * 10 {
        6
    } else if vdisplay * 5 == hdisplay * 4 || vdisplay * 15 == hdisplay * 9 {
        7
    } else {
        10
    }
}

/// Synthesize a mode for the given resolution and refresh rate (mHz) using
/// CVT reduced blanking timings.
///
/// Used for custom modes requested by the compositor, where the connector
/// does not advertise a matching mode.
pub(crate) fn generate_cvt(hdisplay: u32, vdisplay: u32, refresh_mhz: u32) -> drm_ffi::drm_mode_modeinfo {
    let refresh = if refresh_mhz == 0 { 60_000 } else { refresh_mhz } as f64 / 1000.0;

    // estimate the horizontal period from the minimum vertical blank
    let h_period_est = (1_000_000.0 / refresh - RB_MIN_V_BLANK_US) / vdisplay as f64;
    let vbi_lines = (RB_MIN_V_BLANK_US / h_period_est) as u32 + 1;

    let v_sync = cvt_vsync_width(hdisplay, vdisplay);
    let min_vbi = RB_V_FRONT_PORCH + v_sync + MIN_V_BACK_PORCH;
    let act_vbi_lines = vbi_lines.max(min_vbi);

    let vtotal = act_vbi_lines + vdisplay;
    let htotal = hdisplay + RB_H_BLANK;

    let clock_khz = {
        let exact = refresh * vtotal as f64 * htotal as f64 / 1000.0;
        (exact / CLOCK_STEP_KHZ as f64) as u32 * CLOCK_STEP_KHZ
    };

    let hsync_start = hdisplay + RB_H_FRONT_PORCH;
    let hsync_end = hsync_start + RB_H_SYNC;
    let vsync_start = vdisplay + RB_V_FRONT_PORCH;
    let vsync_end = vsync_start + v_sync;

    let mut name = [0 as std::os::raw::c_char; 32];
    let text = format!("{}x{}", hdisplay, vdisplay);
    for (dst, src) in name.iter_mut().zip(text.as_bytes()) {
        *dst = *src as _;
    }

    drm_ffi::drm_mode_modeinfo {
        clock: clock_khz,
        hdisplay: hdisplay as u16,
        hsync_start: hsync_start as u16,
        hsync_end: hsync_end as u16,
        htotal: htotal as u16,
        hskew: 0,
        vdisplay: vdisplay as u16,
        vsync_start: vsync_start as u16,
        vsync_end: vsync_end as u16,
        vtotal: vtotal as u16,
        vscan: 0,
        vrefresh: (refresh + 0.5) as u32,
        flags: DRM_MODE_FLAG_PHSYNC | DRM_MODE_FLAG_NVSYNC,
        type_: DRM_MODE_TYPE_USERDEF,
        name,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cvt_rb_1080p60_matches_reference_timings() {
        // the standard CVT reduced blanking timing for 1920x1080@60
        let mode = generate_cvt(1920, 1080, 60_000);
        assert_eq!(mode.clock, 138_500);
        assert_eq!(mode.hdisplay, 1920);
        assert_eq!(mode.hsync_start, 1968);
        assert_eq!(mode.hsync_end, 2000);
        assert_eq!(mode.htotal, 2080);
        assert_eq!(mode.vdisplay, 1080);
        assert_eq!(mode.vsync_start, 1083);
        assert_eq!(mode.vsync_end, 1088);
        assert_eq!(mode.vtotal, 1111);
        assert_eq!(mode.vrefresh, 60);
    }

    #[test]
    fn cvt_blanking_is_wellformed() {
        for (w, h, r) in [
            (640u32, 480u32, 60_000u32),
            (1280, 720, 60_000),
            (1920, 1080, 144_000),
            (2560, 1440, 75_000),
            (3840, 2160, 30_000),
        ] {
            let mode = generate_cvt(w, h, r);
            assert!(mode.clock > 0);
            assert!(mode.hdisplay < mode.hsync_start);
            assert!(mode.hsync_start < mode.hsync_end);
            assert!(mode.hsync_end < mode.htotal);
            assert!(mode.vdisplay < mode.vsync_start);
            assert!(mode.vsync_start < mode.vsync_end);
            assert!(mode.vsync_end < mode.vtotal);
        }
    }

    #[test]
    fn cvt_zero_refresh_defaults_to_60() {
        let mode = generate_cvt(1280, 720, 0);
        assert_eq!(mode.vrefresh, 60);
    }

    #[test]
    fn generated_refresh_round_trips() {
        // the mHz rate recovered from the synthesized timings must be close
        // to the requested one
        let raw = generate_cvt(1920, 1080, 60_000);
        let mode = KernelMode::from(raw);
        let refresh = refresh_rate(&mode);
        assert!((refresh - 60_000).abs() < 150, "refresh was {}", refresh);
    }
}
