//! 缓存层集成测试
//!
//! 使用内存存储、计数引擎和可切换故障的缓存层，验证并发构建、
//! 两级缓存降级、临时规则淘汰和取消语义。

use async_trait::async_trait;
use chrono::Utc;
use decision_shared::config::RuleCacheConfig;
use parking_lot::RwLock;
use rule_engine::{
    AdhocCache, ArtifactCache, CacheStore, EngineError, MemoryCacheStore, RequestContext,
    RuleCompiler, RuleDefinition, RuleEngine, RuleError, RuleRecord, RuleRecordCache,
    RuleRepository, RuleService, TerseRule, TieredCache,
};
use serde_json::{Map, Value, json};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

// ==================== 测试协作者 ====================

/// 内存规则存储
#[derive(Default)]
struct InMemoryRepository {
    rules: RwLock<HashMap<String, Vec<RuleRecord>>>,
    reads: AtomicUsize,
    down: AtomicBool,
}

impl InMemoryRepository {
    fn put(&self, business_id: &str, records: Vec<RuleRecord>) {
        self.rules.write().insert(business_id.to_string(), records);
    }

    fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RuleRepository for InMemoryRepository {
    async fn find_rules(
        &self,
        business_id: &str,
        enabled_only: bool,
    ) -> rule_engine::Result<Vec<RuleRecord>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if self.down.load(Ordering::SeqCst) {
            return Err(RuleError::CacheIoError("storage unavailable".into()));
        }
        Ok(self
            .rules
            .read()
            .get(business_id)
            .map(|records| {
                records
                    .iter()
                    .filter(|r| !enabled_only || r.enabled)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn list_business_ids(&self) -> rule_engine::Result<Vec<String>> {
        Ok(self.rules.read().keys().cloned().collect())
    }
}

/// 可切换故障的缓存层
struct FlakyStore {
    inner: MemoryCacheStore,
    down: AtomicBool,
}

impl FlakyStore {
    fn new(down: bool) -> Self {
        Self {
            inner: MemoryCacheStore::new(),
            down: AtomicBool::new(down),
        }
    }

    fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    fn check(&self) -> rule_engine::Result<()> {
        if self.down.load(Ordering::SeqCst) {
            Err(RuleError::CacheIoError("connection refused".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl CacheStore for FlakyStore {
    fn name(&self) -> &'static str {
        "flaky"
    }

    async fn get(&self, key: &str) -> rule_engine::Result<Option<Vec<u8>>> {
        self.check()?;
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> rule_engine::Result<()> {
        self.check()?;
        self.inner.set(key, value, ttl).await
    }

    async fn delete(&self, key: &str) -> rule_engine::Result<()> {
        self.check()?;
        self.inner.delete(key).await
    }
}

/// 计数引擎：构建时阻塞一段时间，产物为规则文本
struct SlowEngine {
    builds: AtomicUsize,
    build_time: Duration,
}

impl SlowEngine {
    fn new(build_time: Duration) -> Self {
        Self {
            builds: AtomicUsize::new(0),
            build_time,
        }
    }

    fn builds(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }
}

impl RuleEngine for SlowEngine {
    type Artifact = String;

    fn build(&self, rule_text: &str, _unit_id: &str) -> Result<String, EngineError> {
        std::thread::sleep(self.build_time);
        self.builds.fetch_add(1, Ordering::SeqCst);
        Ok(rule_text.to_string())
    }

    /// 规则文本中每条规则记一次命中，并回显输入
    fn execute(
        &self,
        artifact: &String,
        input: &Value,
        output: &mut Map<String, Value>,
    ) -> Result<(), EngineError> {
        if input.get("fail").is_some() {
            return Err(EngineError::new("evaluation aborted"));
        }
        output.insert(
            "rules".to_string(),
            json!(artifact.matches("Retract(").count()),
        );
        output.insert("input".to_string(), input.clone());
        Ok(())
    }
}

fn record(business_id: &str, id: i64, version: i64, definition: Value) -> RuleRecord {
    RuleRecord {
        id,
        business_id: business_id.to_string(),
        name: format!("{business_id}-{id}"),
        rule_text: String::new(),
        definition: Some(definition),
        enabled: true,
        version,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

fn discount_definition(rate: f64) -> Value {
    json!({
        "type": "structured",
        "id": "discount",
        "condition": {"kind": "simple", "left": "order.amount", "operator": "gte", "right": 100},
        "actions": [{"kind": "assign", "target": "discount", "value": rate}]
    })
}

fn terse(when: &str) -> RuleDefinition {
    let mut then = BTreeMap::new();
    then.insert("hit".to_string(), json!(true));
    TerseRule::new(when, then).into()
}

fn memory_tiers() -> TieredCache {
    TieredCache::new(
        Arc::new(MemoryCacheStore::new()),
        Arc::new(MemoryCacheStore::new()),
    )
}

fn record_cache(repo: Arc<InMemoryRepository>, tiers: TieredCache) -> Arc<RuleRecordCache> {
    Arc::new(RuleRecordCache::new(tiers, repo, Duration::from_secs(60)))
}

// ==================== 业务产物缓存 ====================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_callers_share_single_build() {
    let repo = Arc::new(InMemoryRepository::default());
    repo.put("biz", vec![record("biz", 1, 3, discount_definition(0.1))]);
    let engine = Arc::new(SlowEngine::new(Duration::from_millis(50)));
    let cache = ArtifactCache::new(
        engine.clone(),
        record_cache(repo.clone(), memory_tiers()),
        RuleCompiler::new(),
        4,
    );

    let handles: Vec<_> = (0..16)
        .map(|_| {
            let cache = cache.clone();
            tokio::spawn(async move {
                cache
                    .get_or_build(&RequestContext::background(), "biz")
                    .await
            })
        })
        .collect();

    let mut artifacts = Vec::new();
    for handle in handles {
        artifacts.push(handle.await.unwrap().unwrap());
    }

    assert_eq!(engine.builds(), 1);
    assert_eq!(repo.reads(), 1);
    assert!(artifacts.iter().all(|a| Arc::ptr_eq(a, &artifacts[0])));
    assert_eq!(artifacts[0].version, "v3");
    assert_eq!(artifacts[0].rule_count, 1);

    let stats = cache.stats();
    assert_eq!(stats.builds, 1);
    assert_eq!(stats.entries, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_distinct_keys_build_independently() {
    let repo = Arc::new(InMemoryRepository::default());
    for id in ["a", "b", "c"] {
        repo.put(id, vec![record(id, 1, 1, discount_definition(0.2))]);
    }
    let engine = Arc::new(SlowEngine::new(Duration::from_millis(10)));
    let cache = ArtifactCache::new(
        engine.clone(),
        record_cache(repo, memory_tiers()),
        RuleCompiler::new(),
        8,
    );

    let ctx = RequestContext::background();
    let (a, b, c) = tokio::join!(
        cache.get_or_build(&ctx, "a"),
        cache.get_or_build(&ctx, "b"),
        cache.get_or_build(&ctx, "c"),
    );
    assert_eq!(a.unwrap().key, "a");
    assert_eq!(b.unwrap().key, "b");
    assert_eq!(c.unwrap().key, "c");
    assert_eq!(engine.builds(), 3);

    let mut keys = cache.keys();
    keys.sort();
    assert_eq!(keys, vec!["a", "b", "c"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancelled_caller_does_not_abort_build() {
    let repo = Arc::new(InMemoryRepository::default());
    repo.put("slow", vec![record("slow", 1, 1, discount_definition(0.3))]);
    let engine = Arc::new(SlowEngine::new(Duration::from_millis(200)));
    let cache = ArtifactCache::new(
        engine.clone(),
        record_cache(repo, memory_tiers()),
        RuleCompiler::new(),
        4,
    );

    let ctx = RequestContext::background().with_timeout(Duration::from_millis(20));
    let result = cache.get_or_build(&ctx, "slow").await;
    assert!(matches!(result, Err(RuleError::Cancelled)));

    // 已开始的构建继续完成并写入缓存
    let mut cached = None;
    for _ in 0..50 {
        cached = cache.peek("slow");
        if cached.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(cached.is_some());

    let again = cache
        .get_or_build(&RequestContext::background(), "slow")
        .await
        .unwrap();
    assert!(Arc::ptr_eq(&again, &cached.unwrap()));
    assert_eq!(engine.builds(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_invalidating_other_key_does_not_rebuild_in_flight_key() {
    let repo = Arc::new(InMemoryRepository::default());
    repo.put("a", vec![record("a", 1, 1, discount_definition(0.1))]);
    repo.put("b", vec![record("b", 1, 1, discount_definition(0.2))]);
    let engine = Arc::new(SlowEngine::new(Duration::from_millis(200)));
    let cache = ArtifactCache::new(
        engine.clone(),
        record_cache(repo, memory_tiers()),
        RuleCompiler::new(),
        4,
    );

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let cache = cache.clone();
            tokio::spawn(async move {
                cache
                    .get_or_build(&RequestContext::background(), "b")
                    .await
            })
        })
        .collect();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!cache.invalidate("a"));

    let mut artifacts = Vec::new();
    for handle in handles {
        artifacts.push(handle.await.unwrap().unwrap());
    }
    assert_eq!(engine.builds(), 1);
    assert!(artifacts.iter().all(|a| Arc::ptr_eq(a, &artifacts[0])));
    assert!(Arc::ptr_eq(&cache.peek("b").unwrap(), &artifacts[0]));
}

#[tokio::test]
async fn test_already_cancelled_context_skips_build() {
    let repo = Arc::new(InMemoryRepository::default());
    repo.put("biz", vec![record("biz", 1, 1, discount_definition(0.1))]);
    let engine = Arc::new(SlowEngine::new(Duration::ZERO));
    let cache = ArtifactCache::new(
        engine.clone(),
        record_cache(repo.clone(), memory_tiers()),
        RuleCompiler::new(),
        4,
    );

    let (ctx, handle) = RequestContext::with_cancel();
    handle.cancel();
    let result = cache.get_or_build(&ctx, "biz").await;
    assert!(matches!(result, Err(RuleError::Cancelled)));
    assert_eq!(repo.reads(), 0);
    assert_eq!(engine.builds(), 0);
}

#[tokio::test]
async fn test_unknown_business_is_not_found() {
    let repo = Arc::new(InMemoryRepository::default());
    let cache = ArtifactCache::new(
        Arc::new(SlowEngine::new(Duration::ZERO)),
        record_cache(repo, memory_tiers()),
        RuleCompiler::new(),
        4,
    );

    let err = cache
        .get_or_build(&RequestContext::background(), "ghost")
        .await
        .unwrap_err();
    assert!(matches!(err, RuleError::NotFound(ref id) if id == "ghost"));
    assert!(cache.is_empty());
}

// ==================== 两级缓存降级 ====================

#[tokio::test]
async fn test_record_cache_survives_primary_outage() {
    let repo = Arc::new(InMemoryRepository::default());
    repo.put("biz", vec![record("biz", 1, 1, discount_definition(0.1))]);
    let primary = Arc::new(FlakyStore::new(true));
    let secondary = Arc::new(FlakyStore::new(false));
    let records = record_cache(
        repo.clone(),
        TieredCache::new(primary.clone(), secondary.clone()),
    );
    let ctx = RequestContext::background();

    // 主缓存不可用：读存储，回写次级缓存成功即可
    assert_eq!(records.get(&ctx, "biz").await.unwrap().len(), 1);
    assert_eq!(repo.reads(), 1);

    // 存储也不可用时从次级缓存读取
    repo.set_down(true);
    assert_eq!(records.get(&ctx, "biz").await.unwrap().len(), 1);
    assert_eq!(repo.reads(), 1);

    // 三者都不可用才返回错误
    secondary.set_down(true);
    let err = records.get(&ctx, "biz").await.unwrap_err();
    assert!(matches!(err, RuleError::CacheIoError(_)));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn test_record_cache_prefers_primary_when_healthy() {
    let repo = Arc::new(InMemoryRepository::default());
    repo.put("biz", vec![record("biz", 1, 1, discount_definition(0.1))]);
    let primary = Arc::new(FlakyStore::new(false));
    let secondary = Arc::new(FlakyStore::new(true));
    let records = record_cache(repo.clone(), TieredCache::new(primary, secondary));
    let ctx = RequestContext::background();

    records.get(&ctx, "biz").await.unwrap();
    records.get(&ctx, "biz").await.unwrap();
    assert_eq!(repo.reads(), 1);
}

#[tokio::test]
async fn test_refresh_replaces_cached_records() {
    let repo = Arc::new(InMemoryRepository::default());
    repo.put("biz", vec![record("biz", 1, 1, discount_definition(0.1))]);
    let records = record_cache(repo.clone(), memory_tiers());
    let ctx = RequestContext::background();

    assert_eq!(records.get(&ctx, "biz").await.unwrap()[0].version, 1);

    repo.put("biz", vec![record("biz", 1, 2, discount_definition(0.2))]);
    // 缓存未过期，仍是旧版本
    assert_eq!(records.get(&ctx, "biz").await.unwrap()[0].version, 1);

    let refreshed = records.refresh(&ctx, "biz").await.unwrap();
    assert_eq!(refreshed[0].version, 2);
    assert_eq!(records.get(&ctx, "biz").await.unwrap()[0].version, 2);
}

// ==================== 临时规则缓存 ====================

#[tokio::test]
async fn test_adhoc_entry_expires_after_ttl() {
    let engine = Arc::new(SlowEngine::new(Duration::ZERO));
    let cache = AdhocCache::new(
        engine.clone(),
        RuleCompiler::new(),
        10,
        Duration::from_millis(50),
        4,
    );
    let ctx = RequestContext::background();
    let def = terse("score > 60");

    let first = cache.get_or_build(&ctx, &def).await.unwrap();
    let second = cache.get_or_build(&ctx, &def).await.unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(engine.builds(), 1);

    tokio::time::sleep(Duration::from_millis(80)).await;

    let third = cache.get_or_build(&ctx, &def).await.unwrap();
    assert!(!Arc::ptr_eq(&first, &third));
    assert_eq!(engine.builds(), 2);
    assert_eq!(cache.len(), 1);
}

#[tokio::test]
async fn test_adhoc_capacity_evicts_least_hit() {
    let engine = Arc::new(SlowEngine::new(Duration::ZERO));
    let cache = AdhocCache::new(
        engine.clone(),
        RuleCompiler::new(),
        3,
        Duration::from_secs(60),
        4,
    );
    let ctx = RequestContext::background();
    let defs: Vec<RuleDefinition> = (0..4).map(|i| terse(&format!("score > {i}"))).collect();
    let fingerprints: Vec<String> = defs.iter().map(|d| d.fingerprint().unwrap()).collect();

    for def in &defs[..3] {
        cache.get_or_build(&ctx, def).await.unwrap();
    }
    // defs[0] 命中两次，defs[2] 命中一次，defs[1] 只有构建时的一次
    cache.get_or_build(&ctx, &defs[0]).await.unwrap();
    cache.get_or_build(&ctx, &defs[0]).await.unwrap();
    cache.get_or_build(&ctx, &defs[2]).await.unwrap();

    cache.get_or_build(&ctx, &defs[3]).await.unwrap();

    assert_eq!(cache.len(), 3);
    assert!(cache.contains(&fingerprints[0]));
    assert!(!cache.contains(&fingerprints[1]));
    assert!(cache.contains(&fingerprints[2]));
    assert!(cache.contains(&fingerprints[3]));
    assert_eq!(engine.builds(), 4);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_adhoc_concurrent_identical_definitions_build_once() {
    let engine = Arc::new(SlowEngine::new(Duration::from_millis(50)));
    let cache = AdhocCache::new(
        engine.clone(),
        RuleCompiler::new(),
        10,
        Duration::from_secs(60),
        4,
    );

    let handles: Vec<_> = (0..16)
        .map(|_| {
            let cache = cache.clone();
            tokio::spawn(async move {
                cache
                    .get_or_build(&RequestContext::background(), &terse("order.amount > 500"))
                    .await
            })
        })
        .collect();

    let mut artifacts = Vec::new();
    for handle in handles {
        artifacts.push(handle.await.unwrap().unwrap());
    }
    assert_eq!(engine.builds(), 1);
    assert!(artifacts.iter().all(|a| Arc::ptr_eq(a, &artifacts[0])));
    assert_eq!(cache.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_adhoc_never_exceeds_capacity_under_concurrency() {
    let engine = Arc::new(SlowEngine::new(Duration::from_millis(1)));
    let cache = AdhocCache::new(
        engine,
        RuleCompiler::new(),
        5,
        Duration::from_secs(60),
        8,
    );

    let handles: Vec<_> = (0..40)
        .map(|i| {
            let cache = cache.clone();
            tokio::spawn(async move {
                cache
                    .get_or_build(&RequestContext::background(), &terse(&format!("x > {i}")))
                    .await
            })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap().unwrap();
        assert!(cache.len() <= 5);
    }
    assert!(cache.len() <= 5);
}

// ==================== 规则服务 ====================

fn service(repo: Arc<InMemoryRepository>) -> (RuleService<SlowEngine>, Arc<SlowEngine>) {
    let engine = Arc::new(SlowEngine::new(Duration::ZERO));
    let service = RuleService::new(
        engine.clone(),
        record_cache(repo, memory_tiers()),
        &RuleCacheConfig::default(),
    );
    (service, engine)
}

#[tokio::test]
async fn test_service_execute_stored_rules() {
    let repo = Arc::new(InMemoryRepository::default());
    repo.put(
        "checkout",
        vec![
            record("checkout", 1, 4, discount_definition(0.1)),
            record("checkout", 2, 7, json!({
                "type": "terse",
                "when": "order.amount > 1000",
                "then": {"free_shipping": true}
            })),
        ],
    );
    let (service, engine) = service(repo.clone());
    let ctx = RequestContext::background();

    let output = service
        .execute(&ctx, "checkout", json!({"order": {"amount": 1200}}))
        .await
        .unwrap();
    assert_eq!(output["rules"], json!(2));
    assert_eq!(output["input"]["order"]["amount"], json!(1200));

    let artifact = service.get_or_build_artifact(&ctx, "checkout").await.unwrap();
    assert_eq!(artifact.version, "v7");
    assert_eq!(engine.builds(), 1);

    let stats = service.stats();
    assert_eq!(stats.artifacts.entries, 1);
    assert_eq!(stats.artifacts.builds, 1);
    assert_eq!(stats.entries, 0);
}

#[tokio::test]
async fn test_service_execute_adhoc_and_stats() {
    let (service, engine) = service(Arc::new(InMemoryRepository::default()));
    let ctx = RequestContext::background();
    let def = terse("user.age >= 18");

    service.execute_adhoc(&ctx, &def, json!({"user": {"age": 20}})).await.unwrap();
    service.execute_adhoc(&ctx, &def, json!({"user": {"age": 30}})).await.unwrap();
    assert_eq!(engine.builds(), 1);

    let stats = service.stats();
    assert_eq!(stats.entries, 1);
    assert_eq!(stats.capacity, RuleCacheConfig::default().adhoc_capacity);
    assert!((stats.hit_rate - 0.5).abs() < f64::EPSILON);

    service.clear_all();
    assert_eq!(service.stats().entries, 0);
}

#[tokio::test]
async fn test_service_execution_failure_carries_key() {
    let repo = Arc::new(InMemoryRepository::default());
    repo.put("biz", vec![record("biz", 1, 1, discount_definition(0.1))]);
    let (service, _) = service(repo);

    let err = service
        .execute(&RequestContext::background(), "biz", json!({"fail": true}))
        .await
        .unwrap_err();
    match err {
        RuleError::ExecutionError { key, message } => {
            assert_eq!(key, "biz");
            assert_eq!(message, "evaluation aborted");
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn test_service_refresh_rebuilds_with_new_version() {
    let repo = Arc::new(InMemoryRepository::default());
    repo.put("biz", vec![record("biz", 1, 1, discount_definition(0.1))]);
    let (service, engine) = service(repo.clone());
    let ctx = RequestContext::background();

    let v1 = service.get_or_build_artifact(&ctx, "biz").await.unwrap();
    assert_eq!(v1.version, "v1");

    repo.put("biz", vec![record("biz", 1, 2, discount_definition(0.2))]);
    assert_eq!(service.refresh(&ctx, "biz").await.unwrap(), 1);

    let v2 = service.get_or_build_artifact(&ctx, "biz").await.unwrap();
    assert_eq!(v2.version, "v2");
    assert!(v2.unit.contains("0.2"));
    assert_eq!(engine.builds(), 2);
}

#[tokio::test]
async fn test_service_compile_rejects_invalid_definition() {
    let (service, _) = service(Arc::new(InMemoryRepository::default()));
    let def: RuleDefinition = serde_json::from_value(json!({
        "type": "structured",
        "id": "broken",
        "condition": {"kind": "composite", "operator": "and", "children": []},
        "actions": [{"kind": "stop"}]
    }))
    .unwrap();

    assert!(matches!(
        service.compile(&def),
        Err(RuleError::CompileError { ref rule_id, .. }) if rule_id == "broken"
    ));
    assert!(
        service
            .get_or_build_adhoc_artifact(&RequestContext::background(), &def)
            .await
            .is_err()
    );
    assert_eq!(service.stats().entries, 0);
}
