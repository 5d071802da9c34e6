//! Detection of the console line that marks a server as ready.

/// Decides from a cleaned console line whether startup has finished.
pub trait ReadyPredicate: Send + Sync {
    fn is_ready(&self, line: &str) -> bool;
}

/// Matches the vanilla `Done (12.3s)! For help, type "help"` banner.
#[derive(Debug, Default, Clone, Copy)]
pub struct StartsWithReady;

impl ReadyPredicate for StartsWithReady {
    fn is_ready(&self, line: &str) -> bool {
        line.starts_with("Done (")
    }
}

impl<F> ReadyPredicate for F
where
    F: Fn(&str) -> bool + Send + Sync,
{
    fn is_ready(&self, line: &str) -> bool {
        self(line)
    }
}
