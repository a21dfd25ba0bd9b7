use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, Histogram, IntCounter,
    IntCounterVec,
};

lazy_static::lazy_static! {
    pub static ref HTTP_REQUESTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "decety_http_requests_total", "Total HTTP requests", &["method", "path", "status"]
    ).unwrap();
    pub static ref IMAGES_UPLOADED_TOTAL: IntCounter = register_int_counter!(
        "decety_images_uploaded_total", "Images committed"
    ).unwrap();
    pub static ref VARIANTS_REGISTERED_TOTAL: IntCounter = register_int_counter!(
        "decety_variants_registered_total", "Variants registered"
    ).unwrap();
    pub static ref MATCHES_TOTAL: IntCounterVec = register_int_counter_vec!(
        "decety_matches_total", "Match queries by outcome", &["outcome"]
    ).unwrap();
    pub static ref MATCH_DURATION: Histogram = register_histogram!(
        "decety_match_duration_seconds", "Variant lookup and match duration",
        vec![0.00001, 0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1]
    ).unwrap();
    pub static ref FLOOD_REJECTIONS_TOTAL: IntCounter = register_int_counter!(
        "decety_flood_rejections_total", "Requests rejected by the flood limiter"
    ).unwrap();
}

pub fn init() {
    lazy_static::initialize(&HTTP_REQUESTS_TOTAL);
    lazy_static::initialize(&IMAGES_UPLOADED_TOTAL);
    lazy_static::initialize(&VARIANTS_REGISTERED_TOTAL);
    lazy_static::initialize(&MATCHES_TOTAL);
    lazy_static::initialize(&MATCH_DURATION);
    lazy_static::initialize(&FLOOD_REJECTIONS_TOTAL);
}
