//! Per-request lifecycle: hooks, worker acquisition, stream routing, image
//! handling, redirects, and claim balancing.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;

use crate::api::{GenerateRequest, OutputSink, ProgressUpdate};
use crate::claim::{Claim, ClaimKind};
use crate::dispatcher::{Dispatcher, WorkerAccess};
use crate::driver::{GenerateItem, StreamEnd};
use crate::error::GenError;
use crate::hooks::{PostImageEvent, PreGenerateEvent};
use crate::record::WorkerRecord;

pub(crate) struct PipelineRun {
    pub(crate) images_saved: u32,
    pub(crate) prep: Duration,
    pub(crate) r#gen: Duration,
}

/// Image ordinals within one request: every produced image gets an index,
/// but only accepted ones count as saved.
#[derive(Default)]
struct ImageCounters {
    seen: u32,
    saved: u32,
}

pub(crate) fn timing_report(prep: Duration, r#gen: Duration, count: u32) -> String {
    let divisor = count.max(1) as f64;
    format!(
        "{:.2} (prep) and {:.2} (gen) seconds",
        prep.as_secs_f64() / divisor,
        r#gen.as_secs_f64() / divisor
    )
}

/// Run one request to completion. Every path out of here balances the
/// claim's counters; the access guard releases the worker on drop.
pub(crate) async fn run_generation(
    dispatcher: &Dispatcher,
    request: &GenerateRequest,
    batch_id: &str,
    claim: &Arc<Claim>,
    sink: &Arc<dyn OutputSink>,
    acquire_timeout: Duration,
) -> Result<PipelineRun, GenError> {
    // Pre-generate listeners run before any worker is claimed; a refusal
    // costs nothing.
    dispatcher.hooks().run_pre(&PreGenerateEvent { request, batch_id })?;

    claim.extend(ClaimKind::Gens, 1)?;
    let result = generate_with_redirects(
        dispatcher,
        request,
        batch_id,
        claim,
        sink,
        acquire_timeout,
    )
    .await;
    // The whole outstanding gens count settles in one step, once per
    // top-level request, redirects included.
    claim.complete(ClaimKind::Gens, claim.count(ClaimKind::Gens));

    if let Ok(run) = &result {
        sink.emit(ProgressUpdate::Timing {
            message: timing_report(run.prep, run.r#gen, run.images_saved),
        })
        .await;
    }
    result
}

async fn generate_with_redirects(
    dispatcher: &Dispatcher,
    request: &GenerateRequest,
    batch_id: &str,
    claim: &Arc<Claim>,
    sink: &Arc<dyn OutputSink>,
    acquire_timeout: Duration,
) -> Result<PipelineRun, GenError> {
    let deadline = Instant::now() + acquire_timeout;
    let mut counters = ImageCounters::default();
    let mut prep_total = Duration::ZERO;
    let mut gen_total = Duration::ZERO;

    let filter = |record: &WorkerRecord| {
        request
            .required_features
            .iter()
            .all(|tag| record.has_feature(tag))
    };

    loop {
        let prep_started = Instant::now();

        claim.extend(ClaimKind::Waits, 1)?;
        sink.emit(ProgressUpdate::WaitingForWorker).await;
        let remaining = deadline.saturating_duration_since(Instant::now());
        let will_load = AtomicBool::new(false);
        let acquired = dispatcher
            .acquire(
                &filter,
                request.preferred_model.as_deref(),
                remaining,
                claim,
                || {
                    will_load.store(true, Ordering::Relaxed);
                },
            )
            .await;
        claim.complete(ClaimKind::Waits, 1);
        let access = acquired?;

        if let Some(model) = &request.preferred_model {
            if will_load.load(Ordering::Relaxed) {
                sink.emit(ProgressUpdate::WillLoadModel {
                    model: model.clone(),
                })
                .await;
            }
            if access.record().current_model().as_deref() != Some(model) {
                if !access.driver().load_model(access.record(), model).await? {
                    return Err(GenError::Internal(anyhow::anyhow!(
                        "worker {} refused to load model {model}",
                        access.record().id()
                    )));
                }
                access.record().set_current_model(Some(model.clone()));
                access.touch();
            }
        }
        prep_total += prep_started.elapsed();

        claim.extend(ClaimKind::Live, 1)?;
        let gen_started = Instant::now();
        let end = run_stream(
            dispatcher,
            request,
            batch_id,
            claim,
            sink,
            &access,
            &mut counters,
        )
        .await;
        claim.complete(ClaimKind::Live, 1);
        gen_total += gen_started.elapsed();

        match end {
            Ok(StreamEnd::Complete) => {
                return Ok(PipelineRun {
                    images_saved: counters.saved,
                    prep: prep_total,
                    r#gen: gen_total,
                });
            }
            Ok(StreamEnd::Redirect) => {
                // Free the worker before re-entering acquire; the deadline
                // above is the only bound on redirect chains.
                drop(access);
                claim.extend(ClaimKind::Gens, 1)?;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Drive the driver's stream, routing progress and images as they arrive.
async fn run_stream(
    dispatcher: &Dispatcher,
    request: &GenerateRequest,
    batch_id: &str,
    claim: &Arc<Claim>,
    sink: &Arc<dyn OutputSink>,
    access: &WorkerAccess,
    counters: &mut ImageCounters,
) -> Result<StreamEnd, GenError> {
    let (tx, mut rx) = mpsc::channel::<GenerateItem>(16);
    let driver = access.driver().clone();
    let record = access.record().clone();
    let stream = driver.generate_stream(&record, request, batch_id, tx, claim.token());
    tokio::pin!(stream);

    let mut stream_done: Option<Result<StreamEnd, GenError>> = None;
    loop {
        tokio::select! {
            res = &mut stream, if stream_done.is_none() => {
                stream_done = Some(res);
            }
            item = rx.recv() => match item {
                Some(item) => {
                    handle_item(dispatcher, request, batch_id, sink, access, item, counters)
                        .await?;
                }
                None => {
                    // Sink gone; wait out the driver's terminal result.
                    if stream_done.is_none() {
                        let res = tokio::select! {
                            res = &mut stream => res,
                            _ = access.stalled() => return Err(GenError::Stalled),
                            _ = claim.cancelled() => return Err(GenError::Cancelled),
                        };
                        stream_done = Some(res);
                    }
                    break;
                }
            },
            _ = access.stalled() => return Err(GenError::Stalled),
            _ = claim.cancelled() => return Err(GenError::Cancelled),
        }

        if stream_done.is_some() {
            // Terminal end-of-stream; drain what the driver already queued.
            while let Ok(item) = rx.try_recv() {
                handle_item(dispatcher, request, batch_id, sink, access, item, counters)
                    .await?;
            }
            break;
        }
    }

    stream_done.unwrap_or(Ok(StreamEnd::Complete))
}

async fn handle_item(
    dispatcher: &Dispatcher,
    request: &GenerateRequest,
    batch_id: &str,
    sink: &Arc<dyn OutputSink>,
    access: &WorkerAccess,
    item: GenerateItem,
    counters: &mut ImageCounters,
) -> Result<(), GenError> {
    access.touch();
    match item {
        GenerateItem::Progress(progress) => {
            sink.emit(ProgressUpdate::GenProgress {
                gen_progress: progress,
            })
            .await;
        }
        GenerateItem::Image(image) => {
            let index = counters.seen;
            counters.seen += 1;
            let event = PostImageEvent {
                request,
                batch_id,
                image: &image,
                index,
            };
            match dispatcher.hooks().run_post(&event) {
                // Hard refusal: the whole request fails with the message.
                Err(err) => return Err(err),
                Ok(Some(reason)) => {
                    tracing::info!(batch = batch_id, "image refused: {reason}");
                    return Ok(());
                }
                Ok(None) => {}
            }
            let (image, metadata) = sink.apply_metadata(image, request, index).await;
            sink.save_image(image, metadata).await?;
            access.record().note_image_produced();
            counters.saved += 1;
            sink.emit(ProgressUpdate::ImageSaved { index }).await;
        }
    }
    Ok(())
}
