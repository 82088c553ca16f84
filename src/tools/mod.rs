pub mod circuit;
pub mod dispatch;
pub mod providers;
pub mod queue;

/// Validate temperature is finite and within the range providers accept.
pub fn validate_temperature(temp: Option<f64>) -> Result<(), String> {
    if let Some(t) = temp
        && (t.is_nan() || t.is_infinite() || !(0.0..=2.0).contains(&t))
    {
        return Err(format!("temperature must be between 0.0 and 2.0, got {t}"));
    }
    Ok(())
}

/// Validate prompt is non-empty.
pub fn validate_prompt(prompt: &str) -> Result<(), String> {
    if prompt.trim().is_empty() {
        return Err("prompt must not be empty".to_string());
    }
    Ok(())
}
