//! The per-request state machine behind every proxied endpoint.
//!
//! Received → Admitted → Normalized → (Cached | Leader | Follower) →
//! (Upstream-Running | Replaying) → Responding → Completed | Failed.
//!
//! The per-minute bucket is checked by the handler before normalization;
//! this module picks up at the monthly check and runs the request to a
//! terminal state. The leader's upstream call runs in a detached task so
//! a client disconnect never tears down a flight other waiters depend on.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use axum::{
    body::Body,
    http::{HeaderValue, StatusCode, header},
    response::Response,
};
use bytes::Bytes;
use chrono::Utc;
use futures_util::StreamExt;

use crate::{
    AppState,
    accounting::{
        CacheDisposition, Costing, TokenCounts, body_has_tool_call, estimate_tokens,
        extract_body_usage,
    },
    canonical::{CachePolicy, CanonicalPayload, CanonicalRequest, Endpoint, Fingerprint},
    cache::{CacheEntry, CachePayload, CacheStore, TranscriptChunk},
    coalesce::{FlightForm, FlightPublisher, FlightRef, UnaryResult},
    error::ApiError,
    observability::metrics,
    providers::{Provider, ProviderError, ProviderResponse, build_provider},
    registry::Project,
    streaming::{
        StreamAccountant, StreamEndState, extract_transcript_usage, replay_transcript,
        synthesize_unary_replay, transcript_has_tool_call, transcript_is_complete,
    },
    telemetry::UsageEvent,
};

/// Run a normalized request to completion.
pub async fn execute(
    state: AppState,
    project: Arc<Project>,
    canonical: CanonicalRequest,
    request_id: String,
    started: Instant,
) -> Result<Response, ApiError> {
    state.limiter.check_monthly(&project)?;

    let provider_name = state.model_router.resolve(&canonical.model)?;
    let fingerprint = canonical.fingerprint();

    let cache_allowed = state.config.cache.enabled
        && project.cache_enabled
        && canonical.cache_policy != CachePolicy::Bypass;

    let mut embedding: Option<Arc<Vec<f32>>> = None;

    if cache_allowed {
        // Exact match first, always the cheapest path.
        if let Some(entry) = state.store.lookup_exact(&project.id, &fingerprint)
            && let Some(response) = respond_from_entry(
                &state,
                &project,
                &canonical,
                &entry,
                CacheDisposition::ExactHit,
                &provider_name,
                &request_id,
                started,
            )?
        {
            metrics::record_cache_operation("lookup", "exact_hit");
            return Ok(response);
        }

        // Semantic match second. Embedding failures silently degrade the
        // request to exact-match-only.
        if canonical.endpoint != Endpoint::Embeddings
            && state.config.cache.semantic.enabled
            && let Some(client) = &state.embedding
        {
            embedding = client.embed(&canonical.prompt_text()).await;
            if let Some(vector) = &embedding
                && let Some((entry, similarity)) = state.store.lookup_semantic(
                    &project.id,
                    canonical.endpoint,
                    &canonical.model,
                    vector,
                    project.similarity_threshold,
                )
                && let Some(response) = respond_from_entry(
                    &state,
                    &project,
                    &canonical,
                    &entry,
                    CacheDisposition::SemanticHit(similarity),
                    &provider_name,
                    &request_id,
                    started,
                )?
            {
                metrics::record_cache_operation("lookup", "semantic_hit");
                return Ok(response);
            }
        }

        metrics::record_cache_operation("lookup", "miss");
    } else {
        metrics::record_cache_operation("lookup", "bypass");
    }

    // Single-flight: one upstream request per (project, fingerprint, form).
    let form = if canonical.stream {
        FlightForm::Stream
    } else {
        FlightForm::Unary
    };
    let flight = state
        .coalescer
        .join(&project.id, fingerprint, form);

    if flight.is_leader() {
        spawn_leader(LeaderContext {
            state: state.clone(),
            project: Arc::clone(&project),
            canonical: canonical.clone(),
            fingerprint,
            provider_name: provider_name.clone(),
            cache_allowed,
            embedding: embedding.map(|v| (*v).clone()),
            publisher: flight.publisher(),
        });
    }

    if canonical.stream {
        respond_streaming(state, project, canonical, flight, provider_name, request_id, started)
    } else {
        respond_unary(state, project, canonical, flight, provider_name, request_id, started).await
    }
}

/// Emit the usage event for a request that failed before producing a
/// response body.
pub fn record_failure(
    state: &AppState,
    project: &Project,
    endpoint: Endpoint,
    model: &str,
    request_id: &str,
    started: Instant,
    error: &ApiError,
) {
    state.telemetry.record(UsageEvent {
        request_id: request_id.to_string(),
        project_id: project.id.clone(),
        timestamp: Utc::now(),
        endpoint,
        provider: String::new(),
        model: model.to_string(),
        tokens_in: 0,
        tokens_out: 0,
        cost_usd: 0.0,
        potential_cost_usd: 0.0,
        cached: false,
        coalesced: false,
        cache_similarity: None,
        stream_replayed: false,
        latency_ms: started.elapsed().as_millis() as u64,
        status: "error".to_string(),
        error_kind: Some(error.kind.as_str().to_string()),
        price_stale: false,
    });
}

// ─────────────────────────────────────────────────────────────────────────────
// Cached responses
// ─────────────────────────────────────────────────────────────────────────────

/// Serve a request from a cache entry if the entry's kind can satisfy the
/// requested form. Returns `Ok(None)` when it cannot (a unary request never
/// reads a stream transcript) so the caller continues as a miss.
#[allow(clippy::too_many_arguments)]
fn respond_from_entry(
    state: &AppState,
    project: &Project,
    canonical: &CanonicalRequest,
    entry: &Arc<CacheEntry>,
    disposition: CacheDisposition,
    provider_name: &str,
    request_id: &str,
    started: Instant,
) -> Result<Option<Response>, ApiError> {
    let tokens = TokenCounts::new(entry.tokens_in, entry.tokens_out);
    let quote = state.pricing.price(provider_name, &canonical.model);
    let costing = Costing::compute(quote, tokens, disposition);
    let latency_ms = started.elapsed().as_millis() as u64;

    let response = match (&entry.payload, canonical.stream) {
        (CachePayload::Unary { body, content_type }, false) => {
            let mut response = Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, content_type.as_str())
                .body(Body::from(body.clone()))
                .map_err(|e| ApiError::internal(e.to_string()))?;
            apply_watch_headers(&mut response, &disposition, latency_ms, Some(costing.cost_usd()));
            response
        }
        (CachePayload::Unary { body, .. }, true) => {
            // Entry recorded from a non-streaming call: synthesized
            // single-chunk replay, then [DONE].
            let chunks = synthesize_unary_replay(body);
            replay_response(state, chunks, &disposition, latency_ms, costing.cost_usd())?
        }
        (CachePayload::Stream { chunks }, true) => {
            replay_response(state, chunks.clone(), &disposition, latency_ms, costing.cost_usd())?
        }
        (CachePayload::Stream { .. }, false) => return Ok(None),
    };

    entry.record_hit();

    state.telemetry.record(UsageEvent {
        request_id: request_id.to_string(),
        project_id: project.id.clone(),
        timestamp: Utc::now(),
        endpoint: canonical.endpoint,
        provider: provider_name.to_string(),
        model: canonical.model.clone(),
        tokens_in: tokens.tokens_in,
        tokens_out: tokens.tokens_out,
        cost_usd: costing.cost_usd(),
        potential_cost_usd: costing.potential_cost_usd(),
        cached: true,
        coalesced: false,
        cache_similarity: disposition.similarity(),
        stream_replayed: canonical.stream,
        latency_ms,
        status: "ok".to_string(),
        error_kind: None,
        price_stale: costing.price_is_stale,
    });

    Ok(Some(response))
}

fn replay_response(
    state: &AppState,
    chunks: Vec<TranscriptChunk>,
    disposition: &CacheDisposition,
    latency_ms: u64,
    cost_usd: f64,
) -> Result<Response, ApiError> {
    let stream = replay_transcript(
        chunks,
        Duration::from_millis(state.config.limits.replay_min_delay_ms),
        Duration::from_millis(state.config.limits.replay_max_delay_ms),
    );

    let mut response = sse_response(Body::from_stream(stream))?;
    apply_watch_headers(&mut response, disposition, latency_ms, Some(cost_usd));
    Ok(response)
}

// ─────────────────────────────────────────────────────────────────────────────
// Unary flights
// ─────────────────────────────────────────────────────────────────────────────

async fn respond_unary(
    state: AppState,
    project: Arc<Project>,
    canonical: CanonicalRequest,
    flight: FlightRef,
    provider_name: String,
    request_id: String,
    started: Instant,
) -> Result<Response, ApiError> {
    let coalesced = !flight.is_leader();

    // The leader task enforces the real deadline; this outer bound only
    // protects waiters if that task dies without publishing.
    let grace = Duration::from_secs(state.config.limits.unary_deadline_secs + 5);
    let outcome = match tokio::time::timeout(grace, flight.await_unary()).await {
        Ok(outcome) => outcome,
        Err(_) => Err(ProviderError::DeadlineExceeded(
            state.config.limits.unary_deadline_secs,
        )),
    };
    let latency_ms = started.elapsed().as_millis() as u64;

    match outcome {
        Ok(UnaryResult {
            body,
            content_type,
            tokens_in,
            tokens_out,
        }) => {
            let disposition = if coalesced {
                CacheDisposition::Coalesced
            } else {
                CacheDisposition::Miss
            };
            let tokens = TokenCounts::new(tokens_in, tokens_out);
            let quote = state.pricing.price(&provider_name, &canonical.model);
            let costing = Costing::compute(quote, tokens, disposition);

            state.telemetry.record(UsageEvent {
                request_id,
                project_id: project.id.clone(),
                timestamp: Utc::now(),
                endpoint: canonical.endpoint,
                provider: provider_name,
                model: canonical.model.clone(),
                tokens_in,
                tokens_out,
                cost_usd: costing.cost_usd(),
                potential_cost_usd: costing.potential_cost_usd(),
                cached: coalesced,
                coalesced,
                cache_similarity: disposition.similarity(),
                stream_replayed: false,
                latency_ms,
                status: "ok".to_string(),
                error_kind: None,
                price_stale: costing.price_is_stale,
            });

            let mut response = Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, content_type)
                .body(Body::from(body))
                .map_err(|e| ApiError::internal(e.to_string()))?;
            apply_watch_headers(&mut response, &disposition, latency_ms, Some(costing.cost_usd()));
            Ok(response)
        }
        Err(provider_error) => {
            let api_error = provider_error.into_api_error();
            record_failure(
                &state,
                &project,
                canonical.endpoint,
                &canonical.model,
                &request_id,
                started,
                &api_error,
            );
            Err(api_error)
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Streaming flights
// ─────────────────────────────────────────────────────────────────────────────

fn respond_streaming(
    state: AppState,
    project: Arc<Project>,
    canonical: CanonicalRequest,
    flight: FlightRef,
    provider_name: String,
    request_id: String,
    started: Instant,
) -> Result<Response, ApiError> {
    let coalesced = !flight.is_leader();
    let disposition = if coalesced {
        CacheDisposition::Coalesced
    } else {
        CacheDisposition::Miss
    };
    let latency_ms = started.elapsed().as_millis() as u64;

    let subscriber = flight.subscribe_stream();

    // Telemetry fires when this client's stream ends (or it disconnects).
    // The flight handle is moved into the closure so the waiter
    // registration lives exactly as long as the client's stream does.
    let telemetry_state = state.clone();
    let endpoint = canonical.endpoint;
    let model = canonical.model.clone();
    let provider_for_event = provider_name.clone();
    let quote = state.pricing.price(&provider_name, &canonical.model);
    let prompt_estimate = estimate_tokens(canonical.prompt_text().len());

    let accounted = StreamAccountant::new(subscriber, move |end_state, usage| {
        let _flight = flight;
        let (tokens_in, tokens_out) = usage.unwrap_or((prompt_estimate, 0));
        let tokens = TokenCounts::new(tokens_in, tokens_out);
        let costing = Costing::compute(quote, tokens, disposition);
        let (status, error_kind) = match end_state {
            StreamEndState::Completed => ("ok", None),
            StreamEndState::Failed => ("error", Some("upstream_unavailable".to_string())),
            StreamEndState::Disconnected => ("error", Some("client_disconnect".to_string())),
        };

        telemetry_state.telemetry.record(UsageEvent {
            request_id,
            project_id: project.id.clone(),
            timestamp: Utc::now(),
            endpoint,
            provider: provider_for_event,
            model,
            tokens_in,
            tokens_out,
            cost_usd: costing.cost_usd(),
            potential_cost_usd: costing.potential_cost_usd(),
            cached: coalesced,
            coalesced,
            cache_similarity: disposition.similarity(),
            stream_replayed: false,
            latency_ms: started.elapsed().as_millis() as u64,
            status: status.to_string(),
            error_kind,
            price_stale: costing.price_is_stale,
        });
    });

    let mut response = sse_response(Body::from_stream(accounted))?;
    apply_watch_headers(&mut response, &disposition, latency_ms, None);
    Ok(response)
}

// ─────────────────────────────────────────────────────────────────────────────
// Leader upstream task
// ─────────────────────────────────────────────────────────────────────────────

struct LeaderContext {
    state: AppState,
    project: Arc<Project>,
    canonical: CanonicalRequest,
    fingerprint: Fingerprint,
    provider_name: String,
    cache_allowed: bool,
    embedding: Option<Vec<f32>>,
    publisher: FlightPublisher,
}

/// Detach the upstream call from the handling connection. The task owns
/// the upstream connection and the resulting cache entry until published;
/// it is cancelled only when every waiter has disconnected.
fn spawn_leader(ctx: LeaderContext) {
    let tracker = ctx.state.task_tracker.clone();
    tracker.spawn(async move {
        let Some(provider_config) = ctx.state.config.providers.get(&ctx.provider_name) else {
            ctx.publisher.publish_unary(Err(ProviderError::InvalidRequest(format!(
                "provider '{}' is not configured",
                ctx.provider_name
            ))));
            return;
        };
        let provider = build_provider(
            &ctx.provider_name,
            provider_config,
            ctx.project.credential(&ctx.provider_name),
        );

        if ctx.canonical.stream {
            run_stream_leader(ctx, provider).await;
        } else {
            run_unary_leader(ctx, provider).await;
        }
    });
}

async fn call_provider(
    provider: &dyn Provider,
    client: &reqwest::Client,
    payload: CanonicalPayload,
) -> Result<ProviderResponse, ProviderError> {
    match payload {
        CanonicalPayload::Chat(payload) => provider.chat_completion(client, payload).await,
        CanonicalPayload::Completion(payload) => provider.completion(client, payload).await,
        CanonicalPayload::Embedding(payload) => provider.embeddings(client, payload).await,
    }
}

async fn run_unary_leader(ctx: LeaderContext, provider: Box<dyn Provider>) {
    let deadline_secs = ctx.state.config.limits.unary_deadline_secs;
    let cancel = ctx.publisher.cancellation();
    let call_started = Instant::now();

    let outcome = tokio::select! {
        _ = cancel.cancelled() => {
            // Every waiter disconnected; nothing to publish.
            ctx.publisher.publish_unary(Err(ProviderError::Network(
                "request cancelled by all clients".to_string(),
            )));
            return;
        }
        result = tokio::time::timeout(
            Duration::from_secs(deadline_secs),
            call_provider(provider.as_ref(), &ctx.state.http, ctx.canonical.payload.clone()),
        ) => result,
    };

    let duration = call_started.elapsed().as_secs_f64();
    match outcome {
        Err(_) => {
            metrics::record_provider_request(&ctx.provider_name, &ctx.canonical.model, "timeout", duration);
            ctx.publisher
                .publish_unary(Err(ProviderError::DeadlineExceeded(deadline_secs)));
        }
        Ok(Err(error)) => {
            metrics::record_provider_request(&ctx.provider_name, &ctx.canonical.model, "error", duration);
            ctx.publisher.publish_unary(Err(error));
        }
        Ok(Ok(ProviderResponse::Unary { body, content_type })) => {
            metrics::record_provider_request(&ctx.provider_name, &ctx.canonical.model, "success", duration);
            let tokens = extract_body_usage(&body).unwrap_or_else(|| TokenCounts::new(
                estimate_tokens(ctx.canonical.prompt_text().len()),
                estimate_tokens(body.len()),
            ));

            maybe_insert_unary(&ctx, &body, &content_type, tokens);

            ctx.publisher.publish_unary(Ok(UnaryResult {
                body,
                content_type,
                tokens_in: tokens.tokens_in,
                tokens_out: tokens.tokens_out,
            }));
        }
        Ok(Ok(ProviderResponse::Stream(_))) => {
            ctx.publisher.publish_unary(Err(ProviderError::ServerError {
                status: 200,
                message: "provider returned a stream for a non-streaming request".to_string(),
            }));
        }
    }
}

fn maybe_insert_unary(ctx: &LeaderContext, body: &Bytes, content_type: &str, tokens: TokenCounts) {
    if !ctx.cache_allowed {
        return;
    }
    if ctx.canonical.cache_policy == CachePolicy::IfNoToolCall && body_has_tool_call(body) {
        metrics::record_cache_operation("insert", "tool_call_bypass");
        return;
    }

    let quote = ctx.state.pricing.price(&ctx.provider_name, &ctx.canonical.model);
    let cost = quote.price.cost_microcents(tokens.tokens_in, tokens.tokens_out);

    ctx.state.store.insert(CacheEntry::new(
        ctx.fingerprint,
        ctx.project.id.clone(),
        ctx.canonical.endpoint,
        ctx.canonical.model.clone(),
        ctx.project.cache_ttl,
        CachePayload::Unary {
            body: body.to_vec(),
            content_type: content_type.to_string(),
        },
        tokens.tokens_in,
        tokens.tokens_out,
        cost,
        ctx.embedding.clone(),
    ));
}

async fn run_stream_leader(ctx: LeaderContext, provider: Box<dyn Provider>) {
    let cancel = ctx.publisher.cancellation();
    let deadline = tokio::time::sleep(Duration::from_secs(
        ctx.state.config.limits.streaming_deadline_secs,
    ));
    tokio::pin!(deadline);

    let call_started = Instant::now();
    let connect = tokio::select! {
        _ = cancel.cancelled() => {
            ctx.publisher.fail_stream(ProviderError::Network(
                "request cancelled by all clients".to_string(),
            ));
            return;
        }
        _ = &mut deadline => {
            ctx.publisher.fail_stream(ProviderError::DeadlineExceeded(
                ctx.state.config.limits.streaming_deadline_secs,
            ));
            return;
        }
        result = call_provider(provider.as_ref(), &ctx.state.http, ctx.canonical.payload.clone()) => result,
    };

    let mut upstream = match connect {
        Ok(ProviderResponse::Stream(stream)) => stream,
        Ok(ProviderResponse::Unary { .. }) => {
            ctx.publisher.fail_stream(ProviderError::ServerError {
                status: 200,
                message: "provider returned a unary body for a streaming request".to_string(),
            });
            return;
        }
        Err(error) => {
            metrics::record_provider_request(
                &ctx.provider_name,
                &ctx.canonical.model,
                "error",
                call_started.elapsed().as_secs_f64(),
            );
            ctx.publisher.fail_stream(error);
            return;
        }
    };

    let broadcaster = ctx.publisher.broadcaster();
    let mut transcript: Vec<TranscriptChunk> = Vec::new();
    let mut previous_chunk_at = Instant::now();

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                // All waiters gone mid-stream: drop the upstream
                // connection and discard the partial transcript.
                metrics::record_cache_operation("insert", "partial_discarded");
                ctx.publisher.fail_stream(ProviderError::Network(
                    "request cancelled by all clients".to_string(),
                ));
                return;
            }
            _ = &mut deadline => {
                metrics::record_cache_operation("insert", "partial_discarded");
                ctx.publisher.fail_stream(ProviderError::DeadlineExceeded(
                    ctx.state.config.limits.streaming_deadline_secs,
                ));
                return;
            }
            chunk = upstream.next() => match chunk {
                Some(Ok(bytes)) => {
                    let delay_ms = previous_chunk_at.elapsed().as_millis() as u64;
                    previous_chunk_at = Instant::now();
                    transcript.push(TranscriptChunk {
                        delay_ms,
                        bytes: bytes.to_vec(),
                    });
                    broadcaster.publish_chunk(bytes);
                }
                Some(Err(error)) => {
                    // Partial transcripts are never cached.
                    metrics::record_provider_request(
                        &ctx.provider_name,
                        &ctx.canonical.model,
                        "error",
                        call_started.elapsed().as_secs_f64(),
                    );
                    metrics::record_cache_operation("insert", "partial_discarded");
                    ctx.publisher.fail_stream(error);
                    return;
                }
                None => {
                    metrics::record_provider_request(
                        &ctx.provider_name,
                        &ctx.canonical.model,
                        "success",
                        call_started.elapsed().as_secs_f64(),
                    );
                    ctx.publisher.finish_stream();
                    maybe_insert_transcript(&ctx, transcript);
                    return;
                }
            }
        }
    }
}

fn maybe_insert_transcript(ctx: &LeaderContext, transcript: Vec<TranscriptChunk>) {
    if !ctx.cache_allowed {
        return;
    }
    // A transcript without the [DONE] terminator is partial even though
    // the connection closed cleanly.
    if !transcript_is_complete(&transcript) {
        metrics::record_cache_operation("insert", "partial_discarded");
        return;
    }
    if ctx.canonical.cache_policy == CachePolicy::IfNoToolCall
        && transcript_has_tool_call(&transcript)
    {
        metrics::record_cache_operation("insert", "tool_call_bypass");
        return;
    }

    let tokens = extract_transcript_usage(&transcript)
        .map(|(tokens_in, tokens_out)| TokenCounts::new(tokens_in, tokens_out))
        .unwrap_or_else(|| {
            let body_len: usize = transcript.iter().map(|c| c.bytes.len()).sum();
            TokenCounts::new(
                estimate_tokens(ctx.canonical.prompt_text().len()),
                estimate_tokens(body_len),
            )
        });
    let quote = ctx.state.pricing.price(&ctx.provider_name, &ctx.canonical.model);
    let cost = quote.price.cost_microcents(tokens.tokens_in, tokens.tokens_out);

    ctx.state.store.insert(CacheEntry::new(
        ctx.fingerprint,
        ctx.project.id.clone(),
        ctx.canonical.endpoint,
        ctx.canonical.model.clone(),
        ctx.project.cache_ttl,
        CachePayload::Stream { chunks: transcript },
        tokens.tokens_in,
        tokens.tokens_out,
        cost,
        ctx.embedding.clone(),
    ));
}

// ─────────────────────────────────────────────────────────────────────────────
// Response assembly
// ─────────────────────────────────────────────────────────────────────────────

fn sse_response(body: Body) -> Result<Response, ApiError> {
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .body(body)
        .map_err(|e| ApiError::internal(e.to_string()))
}

fn apply_watch_headers(
    response: &mut Response,
    disposition: &CacheDisposition,
    latency_ms: u64,
    cost_usd: Option<f64>,
) {
    let headers = response.headers_mut();
    headers.insert(
        "X-WatchLLM-Cache",
        HeaderValue::from_static(disposition.header_value()),
    );
    if let Some(similarity) = disposition.similarity_header()
        && let Ok(value) = HeaderValue::try_from(similarity)
    {
        headers.insert("X-WatchLLM-Similarity", value);
    }
    if let Ok(value) = HeaderValue::try_from(latency_ms.to_string()) {
        headers.insert("X-WatchLLM-Latency-Ms", value);
    }
    if let Some(cost) = cost_usd
        && let Ok(value) = HeaderValue::try_from(format!("{:.6}", cost))
    {
        headers.insert("X-WatchLLM-Cost-Usd", value);
    }
}
