use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Once;

use serde::Serialize;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use super::runner::run_ffmpeg;

/// Hardware encoder family detected on the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HwEncoderKind {
    Nvenc,
    Qsv,
    Vaapi,
    Amf,
    VideoToolbox,
}

impl HwEncoderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Nvenc => "nvenc",
            Self::Qsv => "qsv",
            Self::Vaapi => "vaapi",
            Self::Amf => "amf",
            Self::VideoToolbox => "videotoolbox",
        }
    }

    pub fn encoder_name(&self) -> &'static str {
        match self {
            Self::Nvenc => "h264_nvenc",
            Self::Qsv => "h264_qsv",
            Self::Vaapi => "h264_vaapi",
            Self::Amf => "h264_amf",
            Self::VideoToolbox => "h264_videotoolbox",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "nvenc" => Some(Self::Nvenc),
            "qsv" => Some(Self::Qsv),
            "vaapi" => Some(Self::Vaapi),
            "amf" => Some(Self::Amf),
            "videotoolbox" => Some(Self::VideoToolbox),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Process-wide hardware filter mode
// ---------------------------------------------------------------------------

/// Which filter path clip rendering may take. `Cpu` is sticky: once the
/// process backs off (auto-tune or a GPU-path failure) it never returns to
/// CUDA within the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HwFilterMode {
    Auto,
    Cuda,
    Cpu,
}

impl HwFilterMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Cuda => "cuda",
            Self::Cpu => "cpu",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Some(Self::Auto),
            "cuda" => Some(Self::Cuda),
            "cpu" => Some(Self::Cpu),
            _ => None,
        }
    }
}

const MODE_AUTO: u8 = 0;
const MODE_CUDA: u8 = 1;
const MODE_CPU: u8 = 2;

static HW_FILTER_MODE: AtomicU8 = AtomicU8::new(MODE_AUTO);
static HW_FILTER_MODE_INIT: Once = Once::new();

fn init_mode_from_env() {
    HW_FILTER_MODE_INIT.call_once(|| {
        if let Ok(raw) = std::env::var("HW_FILTER_MODE") {
            match HwFilterMode::parse(&raw) {
                Some(mode) => HW_FILTER_MODE.store(encode_mode(mode), Ordering::SeqCst),
                None => warn!("invalid HW_FILTER_MODE '{raw}'; keeping 'auto'"),
            }
        }
    });
}

fn encode_mode(mode: HwFilterMode) -> u8 {
    match mode {
        HwFilterMode::Auto => MODE_AUTO,
        HwFilterMode::Cuda => MODE_CUDA,
        HwFilterMode::Cpu => MODE_CPU,
    }
}

fn decode_mode(raw: u8) -> HwFilterMode {
    match raw {
        MODE_CUDA => HwFilterMode::Cuda,
        MODE_CPU => HwFilterMode::Cpu,
        _ => HwFilterMode::Auto,
    }
}

pub fn hw_filter_mode() -> HwFilterMode {
    init_mode_from_env();
    decode_mode(HW_FILTER_MODE.load(Ordering::SeqCst))
}

/// Set the process-wide filter mode. Leaving `Cpu` is refused so a backoff
/// decision stays in force for the rest of the run.
pub fn set_hw_filter_mode(mode: HwFilterMode) {
    init_mode_from_env();
    let current = decode_mode(HW_FILTER_MODE.load(Ordering::SeqCst));
    if current == HwFilterMode::Cpu && mode != HwFilterMode::Cpu {
        debug!("ignoring HW filter mode change {} -> {} (cpu backoff is sticky)", current.as_str(), mode.as_str());
        return;
    }
    if current != mode {
        info!("setting HW filter mode to '{}'", mode.as_str());
    }
    HW_FILTER_MODE.store(encode_mode(mode), Ordering::SeqCst);
}

#[cfg(test)]
pub fn reset_hw_filter_mode_for_tests() {
    HW_FILTER_MODE.store(MODE_AUTO, Ordering::SeqCst);
}

// The filter mode is process-global; tests that touch it serialize here.
#[cfg(test)]
pub static TEST_MODE_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

// ---------------------------------------------------------------------------
// Capability probing (cached for the process lifetime)
// ---------------------------------------------------------------------------

static FFMPEG_VERSION: OnceCell<String> = OnceCell::const_new();
static ENCODER_LIST: OnceCell<String> = OnceCell::const_new();
static FILTER_LIST: OnceCell<String> = OnceCell::const_new();
static HW_ENCODER: OnceCell<Option<HwEncoderKind>> = OnceCell::const_new();
static CUDA_FILTERS: OnceCell<bool> = OnceCell::const_new();
static GPU_SCALE: OnceCell<bool> = OnceCell::const_new();
static OPENCL_FILTERS: OnceCell<bool> = OnceCell::const_new();
static CUDA_SCALE_FILTER: OnceCell<&'static str> = OnceCell::const_new();
static DIAG_DUMPED: Once = Once::new();

const SMOKE_TIMEOUT_SECS: u64 = 4;

async fn smoke(args: Vec<String>) -> bool {
    match tokio::time::timeout(
        std::time::Duration::from_secs(SMOKE_TIMEOUT_SECS),
        run_ffmpeg(&args),
    )
    .await
    {
        Ok(Ok(_)) => true,
        Ok(Err(e)) => {
            debug!("smoke test failed: {e}");
            false
        }
        Err(_) => {
            debug!("smoke test timed out after {SMOKE_TIMEOUT_SECS}s");
            false
        }
    }
}

/// One-time diagnostic dump when a GPU capability probe fails at runtime.
pub async fn dump_gpu_diagnostics() {
    let mut first = false;
    DIAG_DUMPED.call_once(|| first = true);
    if !first {
        return;
    }
    let version = ffmpeg_version().await;
    let filters = filter_list().await;
    let cuda_lines: Vec<&str> = filters
        .lines()
        .filter(|l| l.contains("cuda") || l.contains("npp") || l.contains("opencl"))
        .collect();
    warn!(
        "GPU filter diagnostics: ffmpeg={} gpu-filters=\n{}",
        version,
        cuda_lines.join("\n")
    );
}

/// `ffmpeg -version` banner, first token after "ffmpeg version".
pub async fn ffmpeg_version() -> String {
    FFMPEG_VERSION
        .get_or_init(|| async {
            let args: Vec<String> = vec!["ffmpeg".into(), "-version".into()];
            match run_ffmpeg(&args).await {
                Ok(out) => out
                    .stdout
                    .split_whitespace()
                    .nth(2)
                    .unwrap_or("unknown")
                    .to_string(),
                Err(_) => "unknown".into(),
            }
        })
        .await
        .clone()
}

/// Major version parsed from the banner; 0 when unknown.
pub async fn ffmpeg_major_version() -> u32 {
    let v = ffmpeg_version().await;
    v.split(['.', '-'])
        .next()
        .and_then(|s| s.parse().ok())
        .unwrap_or(0)
}

async fn encoder_list() -> String {
    ENCODER_LIST
        .get_or_init(|| async {
            let args: Vec<String> = vec![
                "ffmpeg".into(),
                "-hide_banner".into(),
                "-encoders".into(),
            ];
            run_ffmpeg(&args).await.map(|o| o.stdout).unwrap_or_default()
        })
        .await
        .clone()
}

async fn filter_list() -> String {
    FILTER_LIST
        .get_or_init(|| async {
            let args: Vec<String> = vec![
                "ffmpeg".into(),
                "-hide_banner".into(),
                "-filters".into(),
            ];
            run_ffmpeg(&args).await.map(|o| o.stdout).unwrap_or_default()
        })
        .await
        .clone()
}

fn encode_smoke_args(encoder: &str) -> Vec<String> {
    vec![
        "ffmpeg".into(),
        "-hide_banner".into(),
        "-loglevel".into(),
        "error".into(),
        "-f".into(),
        "lavfi".into(),
        "-i".into(),
        "color=c=black:s=128x128:d=0.1".into(),
        "-frames:v".into(),
        "2".into(),
        "-c:v".into(),
        encoder.into(),
        "-f".into(),
        "null".into(),
        "-".into(),
    ]
}

/// The hardware encoder family, confirmed by a minimal encode smoke test.
/// `DISABLE_HWENC=1` reports none.
pub async fn hw_encoder_kind() -> Option<HwEncoderKind> {
    *HW_ENCODER
        .get_or_init(|| async {
            if std::env::var("DISABLE_HWENC").as_deref() == Ok("1") {
                info!("hardware encoding disabled by DISABLE_HWENC");
                return None;
            }
            let listing = encoder_list().await;
            let candidates = [
                HwEncoderKind::Nvenc,
                HwEncoderKind::Qsv,
                HwEncoderKind::Vaapi,
                HwEncoderKind::Amf,
                HwEncoderKind::VideoToolbox,
            ];
            for kind in candidates {
                if !listing.contains(kind.encoder_name()) {
                    continue;
                }
                if smoke(encode_smoke_args(kind.encoder_name())).await {
                    info!("hardware encoder detected: {}", kind.as_str());
                    return Some(kind);
                }
                debug!(
                    "{} listed but failed its encode smoke test",
                    kind.encoder_name()
                );
            }
            None
        })
        .await
}

fn cuda_overlay_smoke_args(scale_filter: &str) -> Vec<String> {
    // Actually composes two frames through scale_cuda + overlay_cuda; a
    // listing alone proves nothing about a usable device.
    let graph = format!(
        "[0:v]format=nv12,hwupload_cuda,{scale_filter}=128:128[a];\
         [1:v]format=nv12,hwupload_cuda,{scale_filter}=64:64[b];\
         [a][b]overlay_cuda=x=8:y=8,hwdownload,format=nv12"
    );
    vec![
        "ffmpeg".into(),
        "-hide_banner".into(),
        "-loglevel".into(),
        "error".into(),
        "-f".into(),
        "lavfi".into(),
        "-i".into(),
        "color=c=black:s=128x128:d=0.1".into(),
        "-f".into(),
        "lavfi".into(),
        "-i".into(),
        "color=c=white:s=64x64:d=0.1".into(),
        "-filter_complex".into(),
        graph,
        "-frames:v".into(),
        "1".into(),
        "-f".into(),
        "null".into(),
        "-".into(),
    ]
}

fn gpu_scale_smoke_args(scale_filter: &str) -> Vec<String> {
    let graph = format!("format=nv12,hwupload_cuda,{scale_filter}=96:96,hwdownload,format=nv12");
    vec![
        "ffmpeg".into(),
        "-hide_banner".into(),
        "-loglevel".into(),
        "error".into(),
        "-f".into(),
        "lavfi".into(),
        "-i".into(),
        "color=c=black:s=128x128:d=0.1".into(),
        "-vf".into(),
        graph,
        "-frames:v".into(),
        "1".into(),
        "-f".into(),
        "null".into(),
        "-".into(),
    ]
}

/// Preferred CUDA scaling filter: `scale_cuda` when listed, else `scale_npp`.
pub async fn preferred_cuda_scale_filter() -> &'static str {
    *CUDA_SCALE_FILTER
        .get_or_init(|| async {
            let filters = filter_list().await;
            if filters.contains("scale_cuda") {
                "scale_cuda"
            } else {
                "scale_npp"
            }
        })
        .await
}

/// CUDA overlay path availability: both filters listed AND the two-frame
/// composition smoke test passes.
pub async fn has_cuda_filters() -> bool {
    *CUDA_FILTERS
        .get_or_init(|| async {
            let filters = filter_list().await;
            if !(filters.contains("overlay_cuda")
                && (filters.contains("scale_cuda") || filters.contains("scale_npp")))
            {
                return false;
            }
            let scale = preferred_cuda_scale_filter().await;
            let ok = smoke(cuda_overlay_smoke_args(scale)).await;
            if !ok {
                dump_gpu_diagnostics().await;
            }
            ok
        })
        .await
}

/// GPU scale-only availability (the hybrid path's prerequisite).
pub async fn has_gpu_scale_filters() -> bool {
    *GPU_SCALE
        .get_or_init(|| async {
            let filters = filter_list().await;
            if !(filters.contains("scale_cuda") || filters.contains("scale_npp")) {
                return false;
            }
            let scale = preferred_cuda_scale_filter().await;
            let ok = smoke(gpu_scale_smoke_args(scale)).await;
            if !ok {
                dump_gpu_diagnostics().await;
            }
            ok
        })
        .await
}

/// OpenCL overlay availability.
pub async fn has_opencl_filters() -> bool {
    *OPENCL_FILTERS
        .get_or_init(|| async {
            let filters = filter_list().await;
            if !(filters.contains("overlay_opencl") && filters.contains("scale_opencl")) {
                return false;
            }
            let graph = "format=rgba,hwupload,scale_opencl=96:96,hwdownload,format=rgba";
            let args: Vec<String> = vec![
                "ffmpeg".into(),
                "-hide_banner".into(),
                "-loglevel".into(),
                "error".into(),
                "-init_hw_device".into(),
                "opencl".into(),
                "-filter_hw_device".into(),
                "opencl".into(),
                "-f".into(),
                "lavfi".into(),
                "-i".into(),
                "color=c=black:s=128x128:d=0.1".into(),
                "-vf".into(),
                graph.into(),
                "-frames:v".into(),
                "1".into(),
                "-f".into(),
                "null".into(),
                "-".into(),
            ];
            smoke(args).await
        })
        .await
}

// ---------------------------------------------------------------------------
// Thread flags
// ---------------------------------------------------------------------------

fn env_usize(name: &str) -> Option<usize> {
    std::env::var(name).ok()?.parse().ok()
}

fn nproc() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Compute `-threads`, `-filter_threads` and `-filter_complex_threads` for a
/// clip invocation, honoring env overrides and caps.
pub fn thread_flags(jobs: Option<&str>, clip_workers: usize, hw_kind: Option<HwEncoderKind>) -> Vec<String> {
    let nproc = nproc();
    let cpu_mode = hw_filter_mode() == HwFilterMode::Cpu;

    let auto_threads = || -> String {
        if cpu_mode {
            std::cmp::max(1, nproc / std::cmp::max(1, clip_workers)).to_string()
        } else {
            "0".into()
        }
    };

    let threads = match jobs.map(|j| j.trim().to_ascii_lowercase()) {
        None => auto_threads(),
        Some(j) if j.is_empty() || j == "auto" || j == "0" => auto_threads(),
        Some(j) => match j.parse::<i64>() {
            Ok(v) if v > 0 => v.to_string(),
            _ => auto_threads(),
        },
    };

    let per_filter = |cap_var: &str| -> String {
        let per = std::cmp::max(1, nproc / std::cmp::max(1, clip_workers));
        let cap = env_usize(cap_var).unwrap_or(4);
        std::cmp::max(1, std::cmp::min(per, cap)).to_string()
    };

    let ft = match env_usize("FFMPEG_FILTER_THREADS") {
        Some(v) => v.to_string(),
        None if cpu_mode => per_filter("FFMPEG_FILTER_THREADS_CAP"),
        None if hw_kind == Some(HwEncoderKind::Nvenc) => "1".into(),
        None => nproc.to_string(),
    };
    let fct = match env_usize("FFMPEG_FILTER_COMPLEX_THREADS") {
        Some(v) => v.to_string(),
        None if cpu_mode => per_filter("FFMPEG_FILTER_COMPLEX_THREADS_CAP"),
        None if hw_kind == Some(HwEncoderKind::Nvenc) => "1".into(),
        None => nproc.to_string(),
    };

    vec![
        "-threads".into(),
        threads,
        "-filter_threads".into(),
        ft,
        "-filter_complex_threads".into(),
        fct,
    ]
}

/// `-benchmark -stats` when profiling is requested via env.
pub fn profile_flags() -> Vec<String> {
    if std::env::var("FFMPEG_PROFILE_MODE").as_deref() == Ok("1") {
        vec!["-benchmark".into(), "-stats".into()]
    } else {
        vec![]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_parse() {
        assert_eq!(HwFilterMode::parse("auto"), Some(HwFilterMode::Auto));
        assert_eq!(HwFilterMode::parse("CUDA"), Some(HwFilterMode::Cuda));
        assert_eq!(HwFilterMode::parse("cpu"), Some(HwFilterMode::Cpu));
        assert_eq!(HwFilterMode::parse("metal"), None);
    }

    #[test]
    fn test_cpu_mode_is_sticky() {
        let _guard = TEST_MODE_LOCK.lock().unwrap();
        reset_hw_filter_mode_for_tests();
        set_hw_filter_mode(HwFilterMode::Cuda);
        set_hw_filter_mode(HwFilterMode::Cpu);
        set_hw_filter_mode(HwFilterMode::Cuda);
        assert_eq!(hw_filter_mode(), HwFilterMode::Cpu);
        reset_hw_filter_mode_for_tests();
    }

    #[test]
    fn test_hw_kind_roundtrip() {
        for kind in [
            HwEncoderKind::Nvenc,
            HwEncoderKind::Qsv,
            HwEncoderKind::Vaapi,
            HwEncoderKind::Amf,
            HwEncoderKind::VideoToolbox,
        ] {
            assert_eq!(HwEncoderKind::from_str(kind.as_str()), Some(kind));
        }
        assert_eq!(HwEncoderKind::from_str("none"), None);
    }

    #[test]
    fn test_thread_flags_explicit_jobs() {
        let _guard = TEST_MODE_LOCK.lock().unwrap();
        reset_hw_filter_mode_for_tests();
        let flags = thread_flags(Some("6"), 2, None);
        assert_eq!(flags[0], "-threads");
        assert_eq!(flags[1], "6");
        assert_eq!(flags[2], "-filter_threads");
        assert_eq!(flags[4], "-filter_complex_threads");
    }

    #[test]
    fn test_thread_flags_auto_non_cpu_mode() {
        let _guard = TEST_MODE_LOCK.lock().unwrap();
        reset_hw_filter_mode_for_tests();
        let flags = thread_flags(Some("auto"), 2, None);
        // auto in non-cpu mode lets ffmpeg decide
        assert_eq!(flags[1], "0");
    }

    #[test]
    fn test_thread_flags_nvenc_pins_filter_threads() {
        let _guard = TEST_MODE_LOCK.lock().unwrap();
        reset_hw_filter_mode_for_tests();
        let flags = thread_flags(Some("4"), 2, Some(HwEncoderKind::Nvenc));
        assert_eq!(flags[3], "1");
        assert_eq!(flags[5], "1");
    }

    #[test]
    fn test_smoke_args_shapes() {
        let args = cuda_overlay_smoke_args("scale_cuda");
        let joined = args.join(" ");
        assert!(joined.contains("overlay_cuda"));
        assert!(joined.contains("scale_cuda=128:128"));
        let args = encode_smoke_args("h264_nvenc");
        assert!(args.join(" ").contains("-c:v h264_nvenc"));
    }
}
