pub const CACHE_HITS_COUNTER: &str = "autopost_gate_flags_cache_hits_total";
pub const CACHE_MISSES_COUNTER: &str = "autopost_gate_flags_cache_misses_total";
pub const BATCH_FETCH_COUNTER: &str = "autopost_gate_flag_store_batch_fetches_total";
pub const SINGLE_FETCH_COUNTER: &str = "autopost_gate_flag_store_single_fetches_total";
pub const MISSING_FLAG_COUNTER: &str = "autopost_gate_missing_flags_total";
pub const CHECK_ERRORS_COUNTER: &str = "autopost_gate_check_errors_total";
pub const FALLBACK_READS_COUNTER: &str = "autopost_gate_fallback_reads_total";
pub const FALLBACK_WRITES_COUNTER: &str = "autopost_gate_fallback_writes_total";
// labelled by outcome: allowed or the block code
pub const GATE_DECISIONS_COUNTER: &str = "autopost_gate_decisions_total";
pub const CACHE_INVALIDATIONS_COUNTER: &str = "autopost_gate_cache_invalidations_total";
