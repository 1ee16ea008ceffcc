//! Demo workflow catalog.
//!
//! Deterministic mock product-research steps: every output is derived from
//! the search keyword, so repeated runs with the same input produce the same
//! result. The catalog covers each workflow shape the engine supports:
//! plain sequences, a parallel group, conditional steps, a retried flaky
//! step, a dynamic workflow and a parameter-mapped step.

use std::time::Duration;

use serde_json::{Map, Value, json};
use stepweave_core::mapping::{MappedStep, ParamMapping};
use stepweave_core::{
    Condition, RegistryError, RetryPolicy, RetryPredicate, StepContext, StepError, WorkflowRegistry,
    step::StepResult, step_fn,
};

/// Parallel group of market-data lookups.
pub const MARKET_DATA_GROUP: &str = "market_data";

/// Register every demo step, group and workflow.
pub fn register_demo_catalog(registry: &WorkflowRegistry) -> Result<(), RegistryError> {
    registry.register_step("normalize_query", step_fn(normalize_query));
    registry.register_step("search_products", step_fn(search_products));
    registry.register_step("fetch_reviews", step_fn(fetch_reviews));
    registry.register_step("fetch_pricing", step_fn(fetch_pricing));
    registry.register_step("estimate_sales", step_fn(estimate_sales));
    registry.register_step("score_opportunity", step_fn(score_opportunity));
    registry.register_step("notify_watchers", step_fn(notify_watchers));
    registry.register_step("premium_insights", step_fn(premium_insights));
    registry.register_step("check_inventory", step_fn(check_inventory));
    registry.register_step(
        "keyword_report",
        MappedStep::new(
            step_fn(keyword_report),
            ParamMapping::new()
                .map("keyword", "input.keyword")
                .map("score", "input.score")
                .map("verdict", "input.verdict")
                .map("monthly_units", "input.estimate_sales.monthly_units"),
        )
        .boxed(),
    );

    registry.register_parallel_group(
        MARKET_DATA_GROUP,
        ["fetch_reviews", "fetch_pricing", "estimate_sales"],
    )?;

    registry.set_condition(
        "notify_watchers",
        Condition::when(|_data, view| {
            view.caller_context
                .get("notify")
                .and_then(Value::as_bool)
                .unwrap_or(false)
        }),
    )?;
    registry.set_condition("premium_insights", Condition::expression("input.score > 60"))?;

    registry.configure_retry(
        "check_inventory",
        RetryPolicy::default()
            .with_max_retries(3)
            .with_initial_delay(Duration::from_millis(50))
            .with_backoff_factor(2.0)
            .with_max_delay(Duration::from_secs(1))
            .with_jitter(true)
            .with_predicate(RetryPredicate::transient()),
    )?;

    registry.register_workflow("quick_lookup", ["normalize_query", "search_products"])?;
    registry.register_workflow(
        "product_research",
        [
            "normalize_query",
            "search_products",
            MARKET_DATA_GROUP,
            "score_opportunity",
            "notify_watchers",
        ],
    )?;
    registry.register_workflow(
        "inventory_check",
        ["normalize_query", "search_products", "check_inventory"],
    )?;
    registry.register_dynamic_workflow("adaptive_research", |input, _context| {
        if input.get("keyword").is_none() {
            anyhow::bail!("input must contain a \"keyword\"");
        }
        let deep = input.get("deep").and_then(Value::as_bool).unwrap_or(false);
        let mut sequence = vec!["normalize_query".to_string(), "search_products".to_string()];
        if deep {
            sequence.extend(
                [MARKET_DATA_GROUP, "score_opportunity", "premium_insights", "keyword_report"]
                    .map(str::to_string),
            );
        }
        Ok(sequence)
    })?;

    tracing::debug!(workflows = registry.list_workflows().len(), "registered demo catalog");
    Ok(())
}

// ---------------------------------------------------------------------------
// Steps
// ---------------------------------------------------------------------------

async fn normalize_query(input: Value, _ctx: StepContext) -> StepResult {
    let keyword = input
        .get("keyword")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .ok_or_else(|| StepError::failed("input must contain a non-empty \"keyword\""))?;
    let marketplace = input
        .get("marketplace")
        .and_then(Value::as_str)
        .unwrap_or("us");

    let mut out = object(&input);
    out.insert("keyword".into(), json!(keyword.to_lowercase()));
    out.insert("marketplace".into(), json!(marketplace.to_uppercase()));
    Ok(Value::Object(out))
}

async fn search_products(input: Value, _ctx: StepContext) -> StepResult {
    let keyword = keyword(&input)?;
    let seed = seed(keyword);

    let products: Vec<Value> = (0..3u64)
        .map(|i| {
            json!({
                "asin": format!("B0{:08}", (seed * (i + 1) * 7_919) % 100_000_000),
                "title": format!("{keyword} #{}", i + 1),
                "price": round2(9.99 + ((seed + i * 7) % 40) as f64),
                "rating": round2(3.0 + ((seed + i) % 20) as f64 / 10.0),
                "reviews": (seed * (i + 3)) % 5_000,
            })
        })
        .collect();

    let mut out = object(&input);
    out.insert("products".into(), Value::Array(products));
    Ok(Value::Object(out))
}

async fn fetch_reviews(input: Value, _ctx: StepContext) -> StepResult {
    let products = products(&input)?;
    let total: u64 = products.iter().filter_map(|p| p["reviews"].as_u64()).sum();
    let ratings: Vec<f64> = products.iter().filter_map(|p| p["rating"].as_f64()).collect();
    Ok(json!({
        "review_count": total,
        "average_rating": round2(mean(&ratings)),
    }))
}

async fn fetch_pricing(input: Value, _ctx: StepContext) -> StepResult {
    let prices: Vec<f64> = products(&input)?
        .iter()
        .filter_map(|p| p["price"].as_f64())
        .collect();
    let min = prices.iter().copied().fold(f64::INFINITY, f64::min);
    let max = prices.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    Ok(json!({
        "min_price": round2(min),
        "max_price": round2(max),
        "avg_price": round2(mean(&prices)),
    }))
}

async fn estimate_sales(input: Value, _ctx: StepContext) -> StepResult {
    let reviews: u64 = products(&input)?
        .iter()
        .filter_map(|p| p["reviews"].as_u64())
        .sum();
    Ok(json!({ "monthly_units": reviews / 4 + 120 }))
}

async fn score_opportunity(input: Value, _ctx: StepContext) -> StepResult {
    let rating = input["fetch_reviews"]["average_rating"]
        .as_f64()
        .ok_or_else(|| StepError::failed("missing fetch_reviews.average_rating"))?;
    let price = input["fetch_pricing"]["avg_price"]
        .as_f64()
        .ok_or_else(|| StepError::failed("missing fetch_pricing.avg_price"))?;
    let units = input["estimate_sales"]["monthly_units"]
        .as_u64()
        .ok_or_else(|| StepError::failed("missing estimate_sales.monthly_units"))?;

    // Demand dominates; low ratings and high prices leave room to compete.
    let demand = (units as f64 / 40.0).min(50.0);
    let gap = (5.0 - rating) * 10.0;
    let margin = (price / 2.0).min(20.0);
    let score = (demand + gap + margin).round().clamp(0.0, 100.0) as u64;

    let verdict = match score {
        70.. => "strong",
        45..70 => "moderate",
        _ => "weak",
    };

    let mut out = object(&input);
    out.insert("score".into(), json!(score));
    out.insert("verdict".into(), json!(verdict));
    Ok(Value::Object(out))
}

async fn notify_watchers(input: Value, ctx: StepContext) -> StepResult {
    let watchers = ctx
        .caller_context()
        .get("watchers")
        .cloned()
        .unwrap_or_else(|| json!([]));
    let mut out = object(&input);
    out.insert("notified".into(), watchers);
    Ok(Value::Object(out))
}

async fn premium_insights(input: Value, _ctx: StepContext) -> StepResult {
    let mut insights = Vec::new();
    if input["fetch_reviews"]["average_rating"].as_f64().unwrap_or(5.0) < 4.0 {
        insights.push("incumbents are poorly rated; quality differentiation is viable");
    }
    if input["fetch_pricing"]["avg_price"].as_f64().unwrap_or(0.0) > 25.0 {
        insights.push("price point supports paid advertising");
    }
    if input["estimate_sales"]["monthly_units"].as_u64().unwrap_or(0) > 1_000 {
        insights.push("demand is well established");
    }

    let mut out = object(&input);
    out.insert("insights".into(), json!(insights));
    Ok(Value::Object(out))
}

async fn keyword_report(input: Value, _ctx: StepContext) -> StepResult {
    let keyword = keyword(&input)?;
    let summary = format!(
        "{keyword}: score {} ({}), ~{} units/month",
        input["score"],
        input["verdict"].as_str().unwrap_or("unknown"),
        input["monthly_units"],
    );
    let mut out = object(&input);
    out.insert("summary".into(), json!(summary));
    Ok(Value::Object(out))
}

/// Stands in for a flaky upstream: the first two attempts get a 503.
async fn check_inventory(input: Value, ctx: StepContext) -> StepResult {
    if ctx.attempt < 3 {
        return Err(StepError::status(503, "inventory service unavailable"));
    }
    let seed = seed(keyword(&input)?);
    let mut out = object(&input);
    out.insert(
        "inventory".into(),
        json!({ "in_stock": seed % 2 == 0, "units": seed % 500 }),
    );
    Ok(Value::Object(out))
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn object(value: &Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

fn keyword(input: &Value) -> Result<&str, StepError> {
    input
        .get("keyword")
        .and_then(Value::as_str)
        .ok_or_else(|| StepError::failed("missing \"keyword\""))
}

fn products(input: &Value) -> Result<&Vec<Value>, StepError> {
    input
        .get("products")
        .and_then(Value::as_array)
        .ok_or_else(|| StepError::failed("missing \"products\""))
}

fn seed(keyword: &str) -> u64 {
    keyword
        .bytes()
        .fold(17u64, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u64))
        % 10_007
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use stepweave_core::repository::memory::{MemoryResultCache, MemoryTraceSink};
    use stepweave_core::{ExecuteOptions, ExecutionError, WorkflowEngine};
    use stepweave_types::execution::RunStatus;

    fn engine() -> WorkflowEngine<MemoryResultCache, MemoryTraceSink> {
        let registry = Arc::new(WorkflowRegistry::new());
        register_demo_catalog(&registry).unwrap();
        WorkflowEngine::new(
            registry,
            Arc::new(MemoryResultCache::new()),
            Arc::new(MemoryTraceSink::new()),
        )
    }

    fn context(value: Value) -> stepweave_core::CallerContext {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn catalog_registers_every_workflow() {
        let registry = WorkflowRegistry::new();
        register_demo_catalog(&registry).unwrap();
        assert_eq!(
            registry.list_workflows(),
            vec!["quick_lookup", "product_research", "inventory_check", "adaptive_research"]
        );
        assert_eq!(
            registry.group_members(MARKET_DATA_GROUP).unwrap(),
            vec!["fetch_reviews", "fetch_pricing", "estimate_sales"]
        );
    }

    #[test]
    fn registering_twice_fails_on_the_group_or_workflow() {
        let registry = WorkflowRegistry::new();
        register_demo_catalog(&registry).unwrap();
        assert!(register_demo_catalog(&registry).is_err());
    }

    #[tokio::test]
    async fn product_research_is_deterministic() {
        let engine = engine();
        let input = json!({ "keyword": "  Yoga Mat " });

        let first = engine
            .run_workflow("product_research", input.clone(), Default::default(), Default::default())
            .await
            .unwrap();
        let second = engine
            .execute_workflow("product_research", input, Default::default(), Default::default())
            .await
            .unwrap();

        assert_eq!(first.output, second);
        assert_eq!(first.output["keyword"], "yoga mat");
        assert_eq!(first.output["marketplace"], "US");
        assert!(first.output["score"].is_u64());
        assert!(first.output.get("notified").is_none());

        let group = first.results.get(MARKET_DATA_GROUP).unwrap();
        let mut keys: Vec<&String> = group.as_object().unwrap().keys().collect();
        keys.sort();
        assert_eq!(keys, vec!["estimate_sales", "fetch_pricing", "fetch_reviews"]);

        let record = first.record.unwrap();
        assert_eq!(record.status, RunStatus::Success);
        assert_eq!(record.skipped_steps(), vec!["notify_watchers"]);
    }

    #[tokio::test]
    async fn notify_runs_when_caller_asks() {
        let engine = engine();
        let output = engine
            .execute_workflow(
                "product_research",
                json!({ "keyword": "desk lamp" }),
                context(json!({ "notify": true, "watchers": ["ops@example.com"] })),
                Default::default(),
            )
            .await
            .unwrap();
        assert_eq!(output["notified"], json!(["ops@example.com"]));
    }

    #[tokio::test]
    async fn missing_keyword_fails_first_step_without_retry_loop() {
        let engine = engine().with_default_retry(RetryPolicy::no_retry());
        let err = engine
            .execute_workflow("quick_lookup", json!({}), Default::default(), Default::default())
            .await
            .unwrap_err();
        match err {
            ExecutionError::StepExecution { step_id, attempts, .. } => {
                assert_eq!(step_id, "normalize_query");
                assert_eq!(attempts, 1);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn inventory_check_succeeds_on_third_attempt() {
        let engine = engine();
        let outcome = engine
            .run_workflow(
                "inventory_check",
                json!({ "keyword": "water bottle" }),
                Default::default(),
                Default::default(),
            )
            .await
            .unwrap();

        assert!(outcome.output["inventory"]["units"].is_u64());
        assert_eq!(outcome.record.unwrap().attempts_for("check_inventory"), 3);
    }

    #[tokio::test]
    async fn adaptive_research_resolves_from_input() {
        let engine = engine();

        let quick = engine
            .run_workflow(
                "adaptive_research",
                json!({ "keyword": "chess set" }),
                Default::default(),
                Default::default(),
            )
            .await
            .unwrap();
        assert!(quick.output.get("products").is_some());
        assert!(quick.output.get("score").is_none());

        let deep = engine
            .run_workflow(
                "adaptive_research",
                json!({ "keyword": "chess set", "deep": true }),
                Default::default(),
                Default::default(),
            )
            .await
            .unwrap();
        let summary = deep.output["summary"].as_str().unwrap();
        assert!(summary.starts_with("chess set: score"));
        assert_eq!(deep.output["keyword"], "chess set");
    }

    #[tokio::test]
    async fn adaptive_research_without_keyword_is_a_resolver_error() {
        let engine = engine();
        let err = engine
            .execute_workflow("adaptive_research", json!({}), Default::default(), Default::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::Resolver { .. }));
    }

    #[tokio::test]
    async fn cached_run_skips_steps() {
        let engine = engine();
        let input = json!({ "keyword": "tea kettle" });
        let fresh = engine
            .run_workflow("quick_lookup", input.clone(), Default::default(), ExecuteOptions::prefer_cache())
            .await
            .unwrap();
        let cached = engine
            .run_workflow("quick_lookup", input, Default::default(), ExecuteOptions::prefer_cache())
            .await
            .unwrap();
        assert!(!fresh.from_cache);
        assert!(cached.from_cache);
        assert_eq!(fresh.output, cached.output);
    }

    #[test]
    fn seed_is_stable() {
        assert_eq!(seed("yoga mat"), seed("yoga mat"));
        assert_ne!(seed("yoga mat"), seed("desk lamp"));
        assert!(seed("anything") < 10_007);
    }
}
