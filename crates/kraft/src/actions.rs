use crate::error::KraftError;

type Action<C> = Box<dyn FnOnce(&mut C) -> Result<(), KraftError> + Send>;

/// Keyed registry of work to perform at the next draw.
///
/// Registering under an existing key replaces the earlier action but keeps
/// its position, so repeated updates of one value collapse into a single call.
pub struct DrawActions<C> {
    entries: Vec<(String, Action<C>)>,
}

impl<C> Default for DrawActions<C> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
        }
    }
}

impl<C> DrawActions<C> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set<F>(&mut self, key: impl Into<String>, action: F)
    where
        F: FnOnce(&mut C) -> Result<(), KraftError> + Send + 'static,
    {
        self.insert(key.into(), Box::new(action));
    }

    fn insert(&mut self, key: String, action: Action<C>) {
        match self.entries.iter_mut().find(|(existing, _)| *existing == key) {
            Some(entry) => entry.1 = action,
            None => self.entries.push((key, action)),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.iter().any(|(existing, _)| existing == key)
    }

    /// Runs every action in registration order and empties the registry.
    /// Stops at the first error; the failed action is consumed and the ones
    /// after it stay registered, ahead of anything registered during the run.
    pub fn run(&mut self, context: &mut C) -> Result<usize, KraftError> {
        let entries = std::mem::take(&mut self.entries);
        let count = entries.len();
        let mut remaining = entries.into_iter();
        while let Some((_, action)) = remaining.next() {
            if let Err(err) = action(context) {
                let added = std::mem::replace(&mut self.entries, remaining.collect());
                for (key, action) in added {
                    self.insert(key, action);
                }
                return Err(err);
            }
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_key_collapses_to_last_action() {
        let mut actions = DrawActions::<Vec<i32>>::new();
        actions.set("color", |log: &mut Vec<i32>| {
            log.push(1);
            Ok(())
        });
        actions.set("color", |log: &mut Vec<i32>| {
            log.push(2);
            Ok(())
        });
        actions.set("color", |log: &mut Vec<i32>| {
            log.push(3);
            Ok(())
        });
        assert_eq!(actions.len(), 1);

        let mut log = Vec::new();
        assert_eq!(actions.run(&mut log).unwrap(), 1);
        assert_eq!(log, vec![3]);
        assert!(actions.is_empty());
    }

    #[test]
    fn replacement_keeps_first_registration_order() {
        let mut actions = DrawActions::<Vec<&'static str>>::new();
        actions.set("a", |log: &mut Vec<&'static str>| {
            log.push("a1");
            Ok(())
        });
        actions.set("b", |log: &mut Vec<&'static str>| {
            log.push("b");
            Ok(())
        });
        actions.set("a", |log: &mut Vec<&'static str>| {
            log.push("a2");
            Ok(())
        });

        let mut log = Vec::new();
        actions.run(&mut log).unwrap();
        assert_eq!(log, vec!["a2", "b"]);
    }

    #[test]
    fn error_stops_the_run_and_keeps_later_actions() {
        let mut actions = DrawActions::<u32>::new();
        actions.set("fail", |_: &mut u32| Err(KraftError::backend("nope")));
        actions.set("count", |count: &mut u32| {
            *count += 1;
            Ok(())
        });

        let mut count = 0;
        assert!(actions.run(&mut count).is_err());
        assert_eq!(count, 0);
        assert!(!actions.contains("fail"));
        assert!(actions.contains("count"));

        assert_eq!(actions.run(&mut count).unwrap(), 1);
        assert_eq!(count, 1);
        assert!(actions.is_empty());
    }
}
