use indicatif::ProgressStyle;

/// Extension trait for creating named progress bars.
pub trait NamedProgress {
    /// Creates a step counter style with a name label.
    fn named_steps(name: &str) -> Self;
}

impl NamedProgress for ProgressStyle {
    fn named_steps(name: &str) -> Self {
        let fmt = format!("{:<31} {{bar:20.cyan/blue}} {{pos}}/{{len}} {{msg}}", name);
        ProgressStyle::default_bar()
            .template(&fmt)
            .unwrap_or(ProgressStyle::default_bar())
    }
}
