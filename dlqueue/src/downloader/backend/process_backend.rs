//! Shared driver for backends that run an external tool.
//!
//! One process is started per enabled category, primary first. Each tool
//! supplies an [`OutputParser`] that classifies its output lines; the driver
//! turns those signals plus the exit status into result flags.

use std::path::PathBuf;
use std::time::Duration;

use tracing::{debug, warn};

use super::traits::{ArtifactKind, AttemptContext, BackendKind, Category, CategoryStatus};
use crate::Error;
use crate::downloader::entry::DownloadStatus;
use crate::downloader::result::{AttemptResult, ResultFlags};
use crate::process::ProcessExit;
use crate::utils::fs::ensure_dir_all_with_op;

/// What a single output line means.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineSignal {
    /// The tool entered a new phase.
    Phase(DownloadStatus),
    /// The tool wrote or found a file.
    Artifact(ArtifactKind, PathBuf),
    /// The tool cannot handle this URL.
    Unsupported,
    /// The tool reported an error.
    Error,
    /// Nothing of interest.
    Noise,
}

/// Tool-specific interpretation of process output.
pub trait OutputParser: Send + Sync {
    fn classify(&self, line: &str) -> LineSignal;

    /// Whether a non-zero exit code alone marks the URL as unsupported.
    fn exit_code_means_unsupported(&self, _code: i32) -> bool {
        false
    }
}

/// Outcome of one category's process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CategoryOutcome {
    Succeeded,
    Failed,
    Unsupported,
    Cancelled,
    /// The backend has no command for this category.
    NotApplicable,
}

impl CategoryOutcome {
    fn status(&self) -> CategoryStatus {
        match self {
            Self::Succeeded => CategoryStatus::Done,
            Self::NotApplicable => CategoryStatus::Skipped,
            Self::Cancelled | Self::Failed | Self::Unsupported => CategoryStatus::Failed,
        }
    }
}

/// Run every category the backend supports and combine their outcomes.
pub async fn run_categories(
    ctx: &AttemptContext,
    kind: BackendKind,
    supported: &[Category],
    parser: &dyn OutputParser,
) -> AttemptResult {
    let categories = ctx.categories_for(supported);
    let Some((&primary, secondaries)) = categories.split_first() else {
        return AttemptResult::unsupported();
    };

    if let Err(e) = ensure_dir_all_with_op("creating output directory", &ctx.target_dir).await {
        warn!(entry_id = ctx.entry_id, error = %e, "Cannot prepare output directory");
        return AttemptResult::failed().with_output(e.to_string());
    }

    let (primary_outcome, mut last_output) = run_category(ctx, kind, primary, parser).await;
    ctx.reporter.category(primary, primary_outcome.status());

    let mut secondary_outcomes = Vec::with_capacity(secondaries.len());
    if matches!(primary_outcome, CategoryOutcome::Succeeded | CategoryOutcome::Failed) {
        for &category in secondaries {
            if ctx.cancel.is_cancelled() {
                secondary_outcomes.push(CategoryOutcome::Cancelled);
                break;
            }
            let (outcome, output) = run_category(ctx, kind, category, parser).await;
            ctx.reporter.category(category, outcome.status());
            if output.is_some() && primary_outcome != CategoryOutcome::Succeeded {
                last_output = output;
            }
            secondary_outcomes.push(outcome);
        }
    }

    let flags = combine_outcomes(primary_outcome, &secondary_outcomes);
    AttemptResult {
        flags,
        last_output,
    }
}

/// Derive attempt flags from the per-category outcomes.
///
/// Only the primary category decides success; a cancellation anywhere stops
/// the whole attempt.
pub fn combine_outcomes(primary: CategoryOutcome, secondaries: &[CategoryOutcome]) -> ResultFlags {
    if primary == CategoryOutcome::Cancelled || secondaries.contains(&CategoryOutcome::Cancelled) {
        return ResultFlags::STOPPED;
    }
    match primary {
        CategoryOutcome::Succeeded => ResultFlags::SUCCESS,
        CategoryOutcome::Unsupported | CategoryOutcome::NotApplicable => ResultFlags::UNSUPPORTED,
        CategoryOutcome::Failed | CategoryOutcome::Cancelled => ResultFlags::MAIN_CATEGORY_FAILED,
    }
}

/// How long output is still read once the process has exited.
const OUTPUT_DRAIN_GRACE: Duration = Duration::from_millis(500);

/// Run the process for one category and classify how it ended.
pub async fn run_category(
    ctx: &AttemptContext,
    kind: BackendKind,
    category: Category,
    parser: &dyn OutputParser,
) -> (CategoryOutcome, Option<String>) {
    let Some(spec) = ctx
        .resolver
        .build_arguments(kind, category, &ctx.target_dir, &ctx.url)
    else {
        debug!(entry_id = ctx.entry_id, backend = %kind, %category, "No command for category");
        return (CategoryOutcome::NotApplicable, None);
    };

    ctx.reporter.category(category, CategoryStatus::Running);

    let mut process = match ctx.supervisor.start(&spec, &ctx.cancel) {
        Ok(process) => process,
        Err(Error::Cancelled) => return (CategoryOutcome::Cancelled, None),
        Err(e) => {
            warn!(entry_id = ctx.entry_id, backend = %kind, error = %e, "Failed to start backend process");
            let message = e.to_string();
            ctx.reporter.output(&message);
            return (CategoryOutcome::Failed, Some(message));
        }
    };

    let mut lines = match process.output_lines() {
        Ok(lines) => Some(lines),
        Err(e) => {
            warn!(entry_id = ctx.entry_id, error = %e, "Cannot read backend output");
            None
        }
    };

    let mut unsupported_seen = false;
    let mut last_output: Option<String> = None;
    let mut handle_line = |line: String| {
        match parser.classify(&line) {
            LineSignal::Phase(status) => ctx.reporter.phase(status),
            LineSignal::Artifact(kind, path) => {
                ctx.reporter.phase(DownloadStatus::Downloading);
                ctx.reporter.artifact(kind, path);
            }
            LineSignal::Unsupported => unsupported_seen = true,
            LineSignal::Error | LineSignal::Noise => {}
        }
        ctx.reporter.output(&line);
        last_output = Some(line);
    };

    let exit = match lines.as_mut() {
        Some(lines) => loop {
            tokio::select! {
                line = lines.recv() => match line {
                    Some(line) => handle_line(line),
                    None => break process.wait().await,
                },
                exit = process.wait() => {
                    // the pumps may still hold the last lines; inherited pipes bound this
                    let grace = tokio::time::sleep(OUTPUT_DRAIN_GRACE);
                    tokio::pin!(grace);
                    loop {
                        tokio::select! {
                            line = lines.recv() => match line {
                                Some(line) => handle_line(line),
                                None => break,
                            },
                            _ = &mut grace => {
                                debug!(entry_id = ctx.entry_id, backend = %kind, "Output still open after exit");
                                break;
                            }
                        }
                    }
                    break exit;
                }
            }
        },
        None => process.wait().await,
    };

    debug!(entry_id = ctx.entry_id, backend = %kind, %category, ?exit, "Backend process finished");

    let outcome = if ctx.cancel.is_cancelled() {
        CategoryOutcome::Cancelled
    } else {
        classify_exit(exit, unsupported_seen, parser)
    };
    (outcome, last_output)
}

fn classify_exit(exit: ProcessExit, unsupported_seen: bool, parser: &dyn OutputParser) -> CategoryOutcome {
    match exit {
        ProcessExit::Exited(Some(0)) if !unsupported_seen => CategoryOutcome::Succeeded,
        ProcessExit::Exited(Some(_)) if unsupported_seen => CategoryOutcome::Unsupported,
        ProcessExit::Exited(Some(code)) if parser.exit_code_means_unsupported(code) => {
            CategoryOutcome::Unsupported
        }
        _ => CategoryOutcome::Failed,
    }
}

/// Strip the quoting tools put around paths in their log lines.
pub(crate) fn unquote(path: &str) -> &str {
    let path = path.trim();
    path.strip_prefix('"')
        .and_then(|p| p.strip_suffix('"'))
        .unwrap_or(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    struct NeverUnsupported;

    impl OutputParser for NeverUnsupported {
        fn classify(&self, _line: &str) -> LineSignal {
            LineSignal::Noise
        }
    }

    #[rstest]
    #[case(CategoryOutcome::Succeeded, &[CategoryOutcome::Failed], ResultFlags::SUCCESS)]
    #[case(CategoryOutcome::Failed, &[CategoryOutcome::Succeeded], ResultFlags::MAIN_CATEGORY_FAILED)]
    #[case(CategoryOutcome::Unsupported, &[], ResultFlags::UNSUPPORTED)]
    #[case(CategoryOutcome::NotApplicable, &[], ResultFlags::UNSUPPORTED)]
    #[case(CategoryOutcome::Succeeded, &[CategoryOutcome::Cancelled], ResultFlags::STOPPED)]
    #[case(CategoryOutcome::Cancelled, &[], ResultFlags::STOPPED)]
    fn test_combine_outcomes(
        #[case] primary: CategoryOutcome,
        #[case] secondaries: &[CategoryOutcome],
        #[case] expected: ResultFlags,
    ) {
        assert_eq!(combine_outcomes(primary, secondaries), expected);
    }

    #[test]
    fn test_classify_exit() {
        let parser = NeverUnsupported;
        assert_eq!(
            classify_exit(ProcessExit::Exited(Some(0)), false, &parser),
            CategoryOutcome::Succeeded
        );
        assert_eq!(
            classify_exit(ProcessExit::Exited(Some(1)), true, &parser),
            CategoryOutcome::Unsupported
        );
        assert_eq!(
            classify_exit(ProcessExit::Exited(Some(1)), false, &parser),
            CategoryOutcome::Failed
        );
        assert_eq!(
            classify_exit(ProcessExit::Terminated(None), false, &parser),
            CategoryOutcome::Failed
        );
        assert_eq!(
            classify_exit(ProcessExit::Abandoned, false, &parser),
            CategoryOutcome::Failed
        );
    }

    #[test]
    fn test_unquote() {
        assert_eq!(unquote("\"/tmp/a b.mp4\""), "/tmp/a b.mp4");
        assert_eq!(unquote(" /tmp/x.mp4 "), "/tmp/x.mp4");
    }
}
