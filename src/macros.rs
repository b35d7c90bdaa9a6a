#[macro_export]
macro_rules! unsigned_ceil_div {
    ($numerator:expr, $denominator:expr) => {{
        1 + (($numerator - 1) / $denominator)
    }};
}
