/// Diagnostic output seam.
///
/// Components that emit diagnostics depend on this trait instead of a
/// concrete logging backend. The agent binds it to the masking,
/// correlation-tagging trace sources in its common layer; tests bind it to
/// whatever they need to observe.
pub trait TraceWriter: Send + Sync {
    /// Log an informational message.
    fn info(&self, message: &str);

    /// Log a verbose / debug message.
    fn verbose(&self, message: &str);

    /// Log a warning message.
    fn warning(&self, message: &str);

    /// Log an error message.
    fn error(&self, message: &str);
}
