use std::thread;

/// Spawns a thread carrying a descriptive name so thread dumps and panics
/// can be attributed to the server they belong to.
pub fn spawn_named_thread<F, T, S>(name: S, f: F) -> thread::JoinHandle<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
    S: ToString,
{
    thread::Builder::new()
        .name(name.to_string())
        .spawn(f)
        .expect("thread name should be valid")
}
