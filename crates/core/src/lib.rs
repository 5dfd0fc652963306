use thiserror::Error;

#[derive(Error, Debug)]
pub enum LifecycleError {
    #[error("unknown lifecycle event '{0}'")]
    UnknownEvent(String),
}

type Hook<C> = Box<dyn FnMut(&mut C) -> anyhow::Result<()>>;

/// Ordered, synchronous lifecycle dispatcher.
///
/// The host declares its events up front ("package", "deploy", ...); plugins
/// subscribe to a spot named `<event>`, `before:<event>` or `after:<event>`.
/// Hooks run in registration order within a spot and the first error halts
/// the pipeline. The context is lent to each hook for the duration of the
/// call only.
pub struct Lifecycle<C> {
    events: Vec<String>,
    hooks: Vec<(String, Hook<C>)>,
}

fn base_event(spot: &str) -> &str {
    spot.strip_prefix("before:")
        .or_else(|| spot.strip_prefix("after:"))
        .unwrap_or(spot)
}

impl<C> Lifecycle<C> {
    pub fn new<I, S>(events: I) -> Self
    where I: IntoIterator<Item = S>, S: Into<String> {
        Self { events: events.into_iter().map(Into::into).collect(), hooks: Vec::new() }
    }

    /// Subscribe a hook to a spot. The spot's base event must be declared.
    pub fn register<F>(&mut self, spot: &str, hook: F) -> Result<(), LifecycleError>
    where F: FnMut(&mut C) -> anyhow::Result<()> + 'static {
        let base = base_event(spot);
        if !self.events.iter().any(|e| e == base) {
            return Err(LifecycleError::UnknownEvent(spot.to_string()));
        }
        self.hooks.push((spot.to_string(), Box::new(hook)));
        Ok(())
    }

    /// Run only the hooks registered at one spot, in registration order.
    pub fn run_spot(&mut self, spot: &str, ctx: &mut C) -> anyhow::Result<()> {
        for (name, hook) in self.hooks.iter_mut() {
            if name == spot { hook(ctx)?; }
        }
        Ok(())
    }

    /// Run one event: before-hooks, then the event's own hooks, then after-hooks.
    pub fn run(&mut self, event: &str, ctx: &mut C) -> anyhow::Result<()> {
        if !self.events.iter().any(|e| e == event) {
            return Err(LifecycleError::UnknownEvent(event.to_string()).into());
        }
        self.run_spot(&format!("before:{event}"), ctx)?;
        self.run_spot(event, ctx)?;
        self.run_spot(&format!("after:{event}"), ctx)?;
        Ok(())
    }

    /// Run every declared event in order.
    pub fn run_all(&mut self, ctx: &mut C) -> anyhow::Result<()> {
        let events = self.events.clone();
        for e in &events {
            self.run(e, ctx)?;
        }
        Ok(())
    }
}
