use serde_json::json;
use std::time::Duration;

use taskpilot_memory::{
    cache_key, CacheConfig, ConfidenceContext, ConfidenceScorer, CorrectionContext,
    ExecutionRecord, LearningStore, MemoryStore, NewCorrection, ToolResultCache,
};

fn correction(tool: &str, success: bool) -> NewCorrection {
    NewCorrection {
        error_type: "tool_error".into(),
        error_message: "replaceInFile: search block not found in src/app.ts".into(),
        tool: tool.into(),
        fix_description: format!("use {tool} on the same target"),
        success,
        context: CorrectionContext::for_path("src/app.ts"),
    }
}

#[test]
fn test_learned_alternative_survives_reload() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("memory.db");
    let db = db.to_str().unwrap();

    let mut learning = LearningStore::default();
    for _ in 0..3 {
        learning.record_correction(correction("replaceInFile", false));
        learning.record_correction(correction("writeFile", true));
    }
    let mut scorer = ConfidenceScorer::new();
    for _ in 0..5 {
        scorer.record_execution(ExecutionRecord::new("writeFile", true, 40));
    }
    MemoryStore::open(db).unwrap().save(&scorer, &learning).unwrap();

    let mut scorer = ConfidenceScorer::new();
    let mut learning = LearningStore::default();
    MemoryStore::open(db)
        .unwrap()
        .load_into(&mut scorer, &mut learning)
        .unwrap();

    let ctx = CorrectionContext::for_path("src/app.ts");
    let rec = learning
        .get_adaptive_tool_selection(
            "tool_error",
            "replaceInFile: search block not found in src/app.ts",
            "replaceInFile",
            Some(&ctx),
        )
        .expect("recommendation");
    assert_eq!(rec.tool, "writeFile");
    assert_eq!(rec.current_success_rate, 0.0);
    assert_eq!(
        learning.suggested_solutions(
            "tool_error",
            "replaceInFile: search block not found in src/app.ts",
            1
        ),
        vec!["use writeFile on the same target".to_string()]
    );

    let score = scorer.calculate_confidence("writeFile", &ConfidenceContext::default());
    assert_eq!(score.sample_size, 5);
}

#[test]
fn test_write_invalidates_cached_reads() {
    let cache = ToolResultCache::new(CacheConfig {
        capacity: 8,
        ttl: Duration::from_secs(60),
    });
    let root = std::path::Path::new("/work");
    let read_a = cache_key("readFile", json!({"path": "a.rs"}).as_object().unwrap());
    let read_b = cache_key("readFile", json!({"path": "b.rs"}).as_object().unwrap());
    let listing = cache_key("listDirectory", json!({"path": "."}).as_object().unwrap());

    cache.put(read_a.clone(), json!("a"), vec![root.join("a.rs")]);
    cache.put(read_b.clone(), json!("b"), vec![root.join("b.rs")]);
    cache.put(listing.clone(), json!(["a.rs", "b.rs"]), vec![root.to_path_buf()]);

    let removed = cache.invalidate_path(&root.join("a.rs"));

    assert_eq!(removed, 2);
    assert!(cache.get(&read_a).is_none());
    assert!(cache.get(&listing).is_none());
    assert_eq!(cache.get(&read_b), Some(json!("b")));
}
