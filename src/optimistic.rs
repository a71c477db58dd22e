/// Tentative-update wrapper: apply a change up front, then either commit it or
/// revert to the snapshot taken before it was applied.
#[derive(Debug, Clone)]
pub struct Optimistic<T: Clone> {
    committed: T,
    tentative: Option<T>,
}

impl<T: Clone> Optimistic<T> {
    pub fn new(value: T) -> Self {
        Self {
            committed: value,
            tentative: None,
        }
    }

    /// The value callers should see right now (tentative if one is pending).
    pub fn current(&self) -> &T {
        self.tentative.as_ref().unwrap_or(&self.committed)
    }

    /// Stacks on top of any pending change; the snapshot stays the last
    /// committed value.
    pub fn apply<F>(&mut self, mutate: F)
    where
        F: FnOnce(&mut T),
    {
        let mut next = self.current().clone();
        mutate(&mut next);
        self.tentative = Some(next);
    }

    pub fn commit(&mut self) {
        if let Some(v) = self.tentative.take() {
            self.committed = v;
        }
    }

    pub fn rollback(&mut self) {
        self.tentative = None;
    }

    /// Apply `mutate`, run `write` against the tentative value, then commit on
    /// `Ok` or roll back on `Err`.
    pub fn run<F, W, R, E>(&mut self, mutate: F, write: W) -> Result<R, E>
    where
        F: FnOnce(&mut T),
        W: FnOnce(&T) -> Result<R, E>,
    {
        self.apply(mutate);
        match write(self.current()) {
            Ok(r) => {
                self.commit();
                Ok(r)
            }
            Err(e) => {
                self.rollback();
                Err(e)
            }
        }
    }

    pub fn into_inner(self) -> T {
        self.committed
    }
}
