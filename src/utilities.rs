pub fn setup_tracing(verbosity_level: u8) {
    let filter = match verbosity_level {
        0 => tracing::level_filters::LevelFilter::INFO,
        1 => tracing::level_filters::LevelFilter::DEBUG,
        2 => tracing::level_filters::LevelFilter::TRACE,
        _ => tracing::level_filters::LevelFilter::TRACE,
    };

    tracing_subscriber::fmt()
        .with_thread_names(true)
        .with_max_level(filter)
        .init();
}

/// Saturating clip to `[min_value, max_value]`.
pub fn clip(value: f32, min_value: f32, max_value: f32) -> f32 {
    if value > max_value {
        max_value
    } else if value < min_value {
        min_value
    } else {
        value
    }
}

pub fn clip_symmetric(value: f32, min_max: f32) -> f32 {
    clip(value, -min_max, min_max)
}
