//! Property tests for the global and per-domain concurrency caps under mixed
//! outcomes, with the circuit breaker live.

mod common;

use std::time::Duration;

use common::*;
use proptest::prelude::*;
use snapcrawl_core::{list_source, Pipeline, RunSummary, TransportError, TransportResponse};

/// What one URL answers with.
#[derive(Debug, Clone, Copy)]
enum Reply {
    Image,
    Unavailable,
    RateLimited,
    Timeout,
    NotFound,
}

fn reply_strategy() -> impl Strategy<Value = Reply> {
    prop_oneof![
        3 => Just(Reply::Image),
        2 => Just(Reply::Unavailable),
        1 => Just(Reply::RateLimited),
        2 => Just(Reply::Timeout),
        1 => Just(Reply::NotFound),
    ]
}

fn reply_for(kind: Reply, body: &[u8]) -> Result<TransportResponse, TransportError> {
    match kind {
        Reply::Image => Ok(image_response(body.to_vec())),
        Reply::Unavailable => Ok(status_response(503)),
        Reply::RateLimited => Ok(TransportResponse {
            status: 429,
            retry_after: Some(Duration::from_millis(5)),
            ..TransportResponse::default()
        }),
        Reply::Timeout => Err(TransportError::Timeout),
        Reply::NotFound => Ok(status_response(404)),
    }
}

#[derive(Debug)]
struct Mix {
    global: usize,
    per_domain: usize,
    domains: usize,
    /// One `(reply, delay_ms)` per URL, spread round-robin over the domains.
    replies: Vec<(Reply, u64)>,
}

fn run_mix(mix: &Mix) -> (MapTransport, RunSummary) {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(4)
        .enable_all()
        .build()
        .unwrap();

    let mut config = test_config();
    config.download.global_concurrency = mix.global;
    config.download.per_domain_concurrency = mix.per_domain;
    config.download.max_pending_items = mix.global * 3;
    config.download.fetch_max_retries = 1;
    config.download.rate_limit_delay_secs = 0;
    // Zero cooldown sends half-open trials as soon as a breaker opens.
    config.breaker.enabled = true;
    config.breaker.failure_threshold = 2;
    config.breaker.base_cooldown_secs = 0;
    config.breaker.max_cooldown_secs = 1;

    let body = png(&render(&distinct_patterns(1, 10)[0]));
    let mut transport = MapTransport::new();
    let mut urls = Vec::new();
    for (i, &(kind, delay_ms)) in mix.replies.iter().enumerate() {
        let url = format!("https://host{}.test/{i}.png", i % mix.domains);
        transport = transport.route_reply(
            url.clone(),
            reply_for(kind, &body),
            Some(Duration::from_millis(delay_ms)),
        );
        urls.push(url);
    }
    let transport = shared(transport);

    let summary = runtime
        .block_on(
            Pipeline::builder(config)
                .transport(transport.clone())
                .sink(shared(MemorySink::new()))
                .build()
                .unwrap()
                .run(list_source(urls)),
        )
        .unwrap();

    drop(runtime);
    let transport = std::sync::Arc::try_unwrap(transport)
        .unwrap_or_else(|_| panic!("transport still shared"));
    (transport, summary)
}

fn mix_strategy() -> impl Strategy<Value = Mix> {
    (1usize..6, 1usize..4, 1usize..5, 1usize..40).prop_flat_map(
        |(global, per_domain, domains, count)| {
            proptest::collection::vec((reply_strategy(), 0u64..4), count).prop_map(
                move |replies| Mix {
                    global,
                    per_domain,
                    domains,
                    replies,
                },
            )
        },
    )
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn prop_caps_hold_under_mixed_outcomes(mix in mix_strategy()) {
        let (transport, summary) = run_mix(&mix);

        prop_assert!(transport.max_global() <= mix.global);
        for d in 0..mix.domains {
            let host = format!("host{d}.test");
            prop_assert!(transport.max_for_domain(&host) <= mix.per_domain);
        }
        prop_assert_eq!(transport.in_flight(), 0);

        let stats = &summary.stats;
        prop_assert_eq!(stats.attempted, mix.replies.len() as u64);
        prop_assert!(stats.is_balanced(), "{:?}", stats);
        // Retries are bounded: at most two requests per URL.
        prop_assert!(transport.total_calls() <= 2 * mix.replies.len());
    }
}

#[test]
fn test_single_domain_is_capped_below_global() {
    let mix = Mix {
        global: 8,
        per_domain: 2,
        domains: 1,
        replies: (0..20).map(|_| (Reply::Unavailable, 3)).collect(),
    };
    let (transport, summary) = run_mix(&mix);
    assert_eq!(transport.max_global(), transport.max_for_domain("host0.test"));
    assert!(transport.max_for_domain("host0.test") <= 2);
    assert!(summary.stats.is_balanced());
}
