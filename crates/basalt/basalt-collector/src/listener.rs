/// Wake-up hook invoked, outside every collector lock, when an agent gains data.
pub trait RecordListener: Send + Sync {
    fn records_available(&self);
}

impl<F> RecordListener for F
where
    F: Fn() + Send + Sync,
{
    fn records_available(&self) {
        self()
    }
}
