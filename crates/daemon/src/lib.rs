//! mkv2cast daemon
//!
//! Background pipeline that scans libraries for source MKVs, decides what
//! each needs (video copy/transcode, audio/subtitle selection), runs them
//! through ffmpeg, and commits the result atomically next to the source.
//! Exposes a `/metrics` endpoint the TUI polls for live status.

pub mod backend;
pub mod command;
pub mod commit;
pub mod concurrency;
pub mod decision;
pub mod history;
pub mod integrity;
pub mod metrics;
pub mod metrics_server;
pub mod pipeline;
pub mod probe;
pub mod process;
pub mod progress;
pub mod runtime;
pub mod scan;
pub mod sink;
pub mod stability;
pub mod startup;
pub mod watch;

pub use mkv2cast_config as config;
pub use mkv2cast_config::Config;

pub use backend::{select_backend, BackendError, HwBackend as SelectedBackend};
pub use command::{build_ffmpeg_args, output_tag, stage_tag};
pub use commit::{commit, CommitError};
pub use concurrency::{derive_plan, ConcurrencyPlan, HostFacts};
pub use decision::{decide, AudioDecision, Decision, SubtitleDecision, TrackAction};
pub use history::{HistoryError, HistoryRecord, HistoryStats, HistoryStatus};
pub use integrity::IntegrityError;
pub use metrics::{
    collect_system_metrics, new_shared_metrics, run_metrics_updater, JobMetrics,
    PipelineSnapshot, SharedMetrics, SystemMetrics,
};
pub use metrics_server::{create_metrics_router, run_metrics_server, ServerError};
pub use pipeline::{JobPipeline, PipelineError, PipelineStats};
pub use probe::{probe, AudioInfo, ProbeError, StreamInfo, SubtitleInfo, VideoInfo};
pub use process::{terminate_all_processes, ProcessError};
pub use runtime::{run_requirements_check, RuntimeError};
pub use scan::{is_video_file, scan_libraries, ScanCandidate, VIDEO_EXTENSIONS};
pub use sink::{JobStatus, NullSink, ProgressSink, Stage, StdMetricsSink};
pub use stability::{check_stability, compare_sizes, StabilityResult};
pub use startup::{run_startup_checks, RequirementsReport, StartupError};
pub use watch::{watch_directory, WatchError};
