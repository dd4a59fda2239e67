//! Power rail controller
//!
//! Every transaction on a rail (an `apply`, a `list`, a whole `sequence`)
//! holds that target's lock from start to end, including settle delays,
//! so a `list` never observes half of an in-flight cycle. The work itself
//! runs in a spawned task: a client that disconnects mid-cycle cannot
//! leave the rail half switched, and daemon shutdown cancels it.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use tb_core::config::Explicit;
use tb_core::error::DriverError;
use tb_core::time::current_time_millis;
use tb_core::traits::PowerDriver;
use tb_core::types::{ComponentSelector, PowerAction};
use tb_core::{BrokerError, TargetId};

use super::{
    ComponentOutcome, ComponentStatus, OutcomeStatus, PowerList, PowerReport, SequenceReport,
    SequenceStep,
};
use crate::drivers::DriverFactory;
use crate::registry::TargetRegistry;

#[derive(Debug, Default)]
struct Record {
    state: Option<bool>,
    last_transition: u64,
}

struct Component {
    name: String,
    explicit: Option<Explicit>,
    driver: Arc<dyn PowerDriver>,
    record: Mutex<Record>,
}

impl Component {
    fn remember(&self, state: bool) {
        let mut record = self.record.lock();
        if record.state != Some(state) {
            record.last_transition = current_time_millis();
        }
        record.state = Some(state);
    }
}

/// One planned step of a transaction
#[derive(Debug, Clone, Copy)]
enum Step {
    Switch { index: usize, on: bool },
    Cycle { index: usize },
    Settle(Duration),
}

impl Step {
    fn component(&self) -> Option<(usize, PowerAction)> {
        match *self {
            Step::Switch { index, on: true } => Some((index, PowerAction::On)),
            Step::Switch { index, on: false } => Some((index, PowerAction::Off)),
            Step::Cycle { index } => Some((index, PowerAction::Cycle)),
            Step::Settle(_) => None,
        }
    }
}

#[derive(Debug, Clone)]
struct Plan {
    action: PowerAction,
    selector: ComponentSelector,
    steps: Vec<Step>,
}

enum SequenceItem {
    Power(Plan),
    Wait(Duration),
}

struct Rail {
    target: TargetId,
    cycle_wait: Duration,
    components: Vec<Component>,
    lock: Arc<tokio::sync::Mutex<()>>,
}

impl Rail {
    fn select(
        &self,
        selector: &ComponentSelector,
        skip: fn(Explicit) -> bool,
    ) -> Result<Vec<usize>, BrokerError> {
        match selector {
            ComponentSelector::All => Ok((0..self.components.len())
                .filter(|&i| !self.components[i].explicit.is_some_and(skip))
                .collect()),
            ComponentSelector::Full => Ok((0..self.components.len()).collect()),
            ComponentSelector::Named(name) => self
                .components
                .iter()
                .position(|c| c.name == *name)
                .map(|i| vec![i])
                .ok_or_else(|| {
                    BrokerError::NotFound(format!("power component {}/{}", self.target, name))
                }),
        }
    }

    fn plan(&self, action: PowerAction, selector: ComponentSelector) -> Result<Plan, BrokerError> {
        let steps = match (action, &selector) {
            (PowerAction::On, _) => self
                .select(&selector, Explicit::skips_on)?
                .into_iter()
                .map(|index| Step::Switch { index, on: true })
                .collect(),
            (PowerAction::Off, _) => self
                .select(&selector, Explicit::skips_off)?
                .into_iter()
                .map(|index| Step::Switch { index, on: false })
                .collect(),
            (PowerAction::Cycle, ComponentSelector::Named(_)) => self
                .select(&selector, Explicit::skips_off)?
                .into_iter()
                .map(|index| Step::Cycle { index })
                .collect(),
            (PowerAction::Cycle, _) => {
                let mut steps: Vec<Step> = self
                    .select(&selector, Explicit::skips_off)?
                    .into_iter()
                    .map(|index| Step::Switch { index, on: false })
                    .collect();
                steps.push(Step::Settle(self.cycle_wait));
                steps.extend(
                    self.select(&selector, Explicit::skips_on)?
                        .into_iter()
                        .map(|index| Step::Switch { index, on: true }),
                );
                steps
            }
        };
        Ok(Plan {
            action,
            selector,
            steps,
        })
    }

    /// Run a plan; the caller holds the rail lock
    async fn run(&self, plan: &Plan, timeout: Duration) -> PowerReport {
        let mut outcomes = Vec::new();
        let mut failed: Option<String> = None;

        for step in &plan.steps {
            if failed.is_some() {
                if let Some((index, action)) = step.component() {
                    outcomes.push(ComponentOutcome {
                        component: self.components[index].name.clone(),
                        action,
                        status: OutcomeStatus::NotAttempted,
                    });
                }
                continue;
            }

            let (index, action, result) = match *step {
                Step::Settle(wait) => {
                    if !wait.is_zero() {
                        tokio::time::sleep(wait).await;
                    }
                    continue;
                }
                Step::Switch { index, on } => {
                    let action = if on { PowerAction::On } else { PowerAction::Off };
                    (index, action, self.switch(index, on, timeout).await)
                }
                Step::Cycle { index } => (index, PowerAction::Cycle, self.cycle(index, timeout).await),
            };

            let component = &self.components[index];
            let status = match result {
                Ok(true) => OutcomeStatus::Succeeded,
                Ok(false) => OutcomeStatus::Unchanged,
                Err(e) => {
                    tracing::warn!(
                        target_id = %self.target,
                        component = %component.name,
                        action = %action,
                        "Power action failed: {}",
                        e
                    );
                    failed = Some(component.name.clone());
                    OutcomeStatus::Failed {
                        reason: e.to_string(),
                    }
                }
            };
            outcomes.push(ComponentOutcome {
                component: component.name.clone(),
                action,
                status,
            });
        }

        PowerReport {
            target: self.target.clone(),
            action: plan.action,
            selector: plan.selector.to_string(),
            outcomes,
            failed,
        }
    }

    /// Drive a component to `on`; returns whether the driver was invoked
    async fn switch(&self, index: usize, on: bool, timeout: Duration) -> Result<bool, DriverError> {
        let component = &self.components[index];
        let current = bounded(timeout, component.driver.state()).await?;
        if current == on {
            component.remember(on);
            return Ok(false);
        }

        if on {
            bounded(timeout, component.driver.on()).await?;
        } else {
            bounded(timeout, component.driver.off()).await?;
        }
        component.remember(on);
        tracing::debug!(target_id = %self.target, component = %component.name, on, "Power switched");
        Ok(true)
    }

    async fn cycle(&self, index: usize, timeout: Duration) -> Result<bool, DriverError> {
        let component = &self.components[index];
        // The settle delay is not the driver's fault
        bounded(
            timeout + self.cycle_wait,
            component.driver.cycle(self.cycle_wait),
        )
        .await?;
        component.remember(true);
        Ok(true)
    }

    /// Query every component; the caller holds the rail lock
    async fn query(&self, timeout: Duration) -> Result<PowerList, BrokerError> {
        let states = join_all(
            self.components
                .iter()
                .map(|c| bounded(timeout, c.driver.state())),
        )
        .await;

        let mut components = Vec::with_capacity(self.components.len());
        for (component, state) in self.components.iter().zip(states) {
            let state = state.map_err(|e| {
                tracing::warn!(
                    target_id = %self.target,
                    component = %component.name,
                    action = "state",
                    "Power state query failed: {}",
                    e
                );
                BrokerError::driver(self.target.as_str(), component.name.as_str(), "state", e)
            })?;
            component.remember(state);
            components.push(ComponentStatus {
                name: component.name.clone(),
                state,
                explicit: component.explicit,
                last_transition: component.record.lock().last_transition,
            });
        }
        Ok(PowerList::aggregate(components))
    }
}

async fn bounded<T>(
    timeout: Duration,
    call: impl Future<Output = Result<T, DriverError>>,
) -> Result<T, DriverError> {
    tokio::time::timeout(timeout, call)
        .await
        .map_err(|_| DriverError::Timeout(timeout))?
}

/// Drives the power rails of every registered target
pub struct PowerController {
    rails: HashMap<TargetId, Arc<Rail>>,
    driver_timeout: Duration,
    cancel: CancellationToken,
}

impl PowerController {
    /// Bind a driver to every configured power component
    pub fn new(
        registry: &TargetRegistry,
        drivers: &dyn DriverFactory,
        driver_timeout: Duration,
        cancel: CancellationToken,
    ) -> Self {
        let rails = registry
            .list()
            .into_iter()
            .map(|entry| {
                let components = entry
                    .config
                    .power
                    .iter()
                    .map(|config| Component {
                        name: config.name.clone(),
                        explicit: config.explicit,
                        driver: drivers.power(&entry.id, config),
                        record: Mutex::new(Record::default()),
                    })
                    .collect();
                let rail = Rail {
                    target: entry.id.clone(),
                    cycle_wait: entry.config.power_cycle_wait,
                    components,
                    lock: Arc::new(tokio::sync::Mutex::new(())),
                };
                (entry.id.clone(), Arc::new(rail))
            })
            .collect();

        Self {
            rails,
            driver_timeout,
            cancel,
        }
    }

    fn rail(&self, target: &TargetId) -> Result<Arc<Rail>, BrokerError> {
        self.rails
            .get(target)
            .cloned()
            .ok_or_else(|| BrokerError::NotFound(format!("target {}", target)))
    }

    /// Run `op` as a subtask holding the rail lock
    async fn transaction<T, F, Fut>(&self, rail: Arc<Rail>, op: F) -> Result<T, BrokerError>
    where
        F: FnOnce(Arc<Rail>, Duration) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, BrokerError>> + Send + 'static,
        T: Send + 'static,
    {
        let timeout = self.driver_timeout;
        let cancel = self.cancel.clone();
        let target = rail.target.clone();

        let task = tokio::spawn(async move {
            let _guard = Arc::clone(&rail.lock).lock_owned().await;
            tokio::select! {
                result = op(rail, timeout) => result,
                _ = cancel.cancelled() => Err(BrokerError::Conflict(
                    "power action interrupted by broker shutdown".into(),
                )),
            }
        });

        task.await.map_err(|e| {
            tracing::error!(target_id = %target, "Power task failed: {}", e);
            BrokerError::InvariantViolation(format!("power task for {} failed: {}", target, e))
        })?
    }

    /// Apply a power action to the selected components of a target's rail.
    ///
    /// A driver failure stops the action. The report then names the failed
    /// component and marks the remaining ones as not attempted.
    ///
    /// # Arguments
    ///
    /// * `target` - Target whose rail is driven
    /// * `action` - `on`, `off` or `cycle`
    /// * `selector` - Which components the action covers
    pub async fn apply(
        &self,
        target: &TargetId,
        action: PowerAction,
        selector: ComponentSelector,
    ) -> Result<PowerReport, BrokerError> {
        let rail = self.rail(target)?;
        let plan = rail.plan(action, selector)?;
        tracing::info!(target_id = %target, action = %action, selector = %plan.selector, "Applying power action");

        self.transaction(rail, move |rail, timeout| async move {
            Ok(rail.run(&plan, timeout).await)
        })
        .await
    }

    /// Run several power steps as one transaction
    pub async fn sequence(
        &self,
        target: &TargetId,
        steps: Vec<SequenceStep>,
    ) -> Result<SequenceReport, BrokerError> {
        if steps.is_empty() {
            return Err(BrokerError::InvalidInput("empty power sequence".into()));
        }
        let rail = self.rail(target)?;
        // Resolve every selector before touching the rail
        let items = steps
            .into_iter()
            .map(|step| match step {
                SequenceStep::Power { action, selector } => {
                    rail.plan(action, selector).map(SequenceItem::Power)
                }
                SequenceStep::Wait(wait) => Ok(SequenceItem::Wait(wait)),
            })
            .collect::<Result<Vec<_>, BrokerError>>()?;
        tracing::info!(target_id = %target, steps = items.len(), "Running power sequence");

        self.transaction(rail, move |rail, timeout| async move {
            let mut reports = Vec::new();
            for item in items {
                let plan = match item {
                    SequenceItem::Wait(wait) => {
                        tokio::time::sleep(wait).await;
                        continue;
                    }
                    SequenceItem::Power(plan) => plan,
                };
                let report = rail.run(&plan, timeout).await;
                let ok = report.is_success();
                reports.push(report);
                if !ok {
                    return Ok(SequenceReport {
                        reports,
                        completed: false,
                    });
                }
            }
            Ok(SequenceReport {
                reports,
                completed: true,
            })
        })
        .await
    }

    /// Current state of every component of a target, queried as one
    /// transaction
    pub async fn list(&self, target: &TargetId) -> Result<PowerList, BrokerError> {
        let rail = self.rail(target)?;
        self.transaction(rail, |rail, timeout| async move { rail.query(timeout).await })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use async_trait::async_trait;
    use tb_core::config::{ConsoleConfig, PowerComponentConfig, PowerDriverConfig, TargetConfig};
    use tb_core::traits::ConsoleDriver;
    use tb_core::ErrorKind;

    use crate::drivers::LoopbackConsole;
    use crate::power::{OutcomeStatus, Substate};
    use crate::registry::tests::qemu_target;

    #[derive(Clone, Copy, PartialEq)]
    enum Mode {
        Works,
        Fails,
        Hangs,
    }

    struct TestPower {
        mode: Mode,
        powered: AtomicBool,
        switches: AtomicUsize,
    }

    #[async_trait]
    impl PowerDriver for TestPower {
        async fn on(&self) -> Result<(), DriverError> {
            self.set(true).await
        }

        async fn off(&self) -> Result<(), DriverError> {
            self.set(false).await
        }

        async fn state(&self) -> Result<bool, DriverError> {
            Ok(self.powered.load(Ordering::SeqCst))
        }
    }

    impl TestPower {
        async fn set(&self, on: bool) -> Result<(), DriverError> {
            self.switches.fetch_add(1, Ordering::SeqCst);
            match self.mode {
                Mode::Works => {
                    self.powered.store(on, Ordering::SeqCst);
                    Ok(())
                }
                Mode::Fails => Err(DriverError::Other("relay stuck".into())),
                Mode::Hangs => std::future::pending().await,
            }
        }
    }

    /// Components named `bad*` fail, `hung*` never answer
    #[derive(Default)]
    struct TestDrivers {
        bound: parking_lot::Mutex<HashMap<String, Arc<TestPower>>>,
    }

    impl TestDrivers {
        fn switches(&self, component: &str) -> usize {
            self.bound.lock()[component].switches.load(Ordering::SeqCst)
        }
    }

    impl DriverFactory for TestDrivers {
        fn power(&self, _: &TargetId, component: &PowerComponentConfig) -> Arc<dyn PowerDriver> {
            let mode = if component.name.starts_with("bad") {
                Mode::Fails
            } else if component.name.starts_with("hung") {
                Mode::Hangs
            } else {
                Mode::Works
            };
            let driver = Arc::new(TestPower {
                mode,
                powered: AtomicBool::new(false),
                switches: AtomicUsize::new(0),
            });
            self.bound
                .lock()
                .insert(component.name.clone(), Arc::clone(&driver));
            driver
        }

        fn console(&self, _: &TargetId, _: &ConsoleConfig) -> Arc<dyn ConsoleDriver> {
            Arc::new(LoopbackConsole::new())
        }
    }

    fn rail_target(components: &[(&str, Option<Explicit>)], wait: Duration) -> TargetConfig {
        let mut target = qemu_target("board");
        target.power = components
            .iter()
            .map(|(name, explicit)| PowerComponentConfig {
                name: name.to_string(),
                driver: PowerDriverConfig::Simulated { initial: false },
                explicit: *explicit,
            })
            .collect();
        target.power_cycle_wait = wait;
        target
    }

    fn controller(target: TargetConfig) -> (PowerController, Arc<TestDrivers>) {
        let registry = TargetRegistry::new(vec![target]);
        let drivers = Arc::new(TestDrivers::default());
        let controller = PowerController::new(
            &registry,
            &*drivers,
            Duration::from_secs(60),
            CancellationToken::new(),
        );
        (controller, drivers)
    }

    fn board() -> TargetId {
        TargetId::new("board")
    }

    #[tokio::test]
    async fn test_on_then_list() {
        let (power, _) = controller(rail_target(&[("relay", None), ("dut", None)], Duration::ZERO));
        let report = power
            .apply(&board(), PowerAction::On, ComponentSelector::All)
            .await
            .unwrap();
        assert!(report.is_success());
        assert_eq!(report.outcomes.len(), 2);

        let list = power.list(&board()).await.unwrap();
        assert!(list.state);
        assert_eq!(list.substate, Substate::Full);
        assert_eq!(list.get("dut"), Some(true));
    }

    #[tokio::test]
    async fn test_off_is_idempotent() {
        let (power, drivers) = controller(rail_target(&[("relay", None)], Duration::ZERO));
        let report = power
            .apply(&board(), PowerAction::Off, ComponentSelector::All)
            .await
            .unwrap();
        assert!(report.is_success());
        assert_eq!(
            report.outcome("relay", PowerAction::Off),
            Some(&OutcomeStatus::Unchanged)
        );
        assert_eq!(drivers.switches("relay"), 0);
        assert!(!power.list(&board()).await.unwrap().state);
    }

    #[tokio::test]
    async fn test_cycle_failure_aborts_rest() {
        let (power, drivers) = controller(rail_target(
            &[("first", None), ("bad-second", None), ("third", None)],
            Duration::ZERO,
        ));
        let report = power
            .apply(&board(), PowerAction::Cycle, ComponentSelector::All)
            .await
            .unwrap();

        assert_eq!(report.failed.as_deref(), Some("bad-second"));
        assert_eq!(
            report.outcome("first", PowerAction::On),
            Some(&OutcomeStatus::Succeeded)
        );
        assert!(matches!(
            report.outcome("bad-second", PowerAction::On),
            Some(OutcomeStatus::Failed { reason }) if reason.contains("relay stuck")
        ));
        assert_eq!(
            report.outcome("third", PowerAction::On),
            Some(&OutcomeStatus::NotAttempted)
        );
        // No retry
        assert_eq!(drivers.switches("bad-second"), 1);
        assert_eq!(drivers.switches("third"), 0);
    }

    #[tokio::test]
    async fn test_explicit_components() {
        let (power, _) = controller(rail_target(
            &[("relay", None), ("jtag", Some(Explicit::On))],
            Duration::ZERO,
        ));

        power
            .apply(&board(), PowerAction::On, ComponentSelector::All)
            .await
            .unwrap();
        let list = power.list(&board()).await.unwrap();
        assert_eq!(list.get("jtag"), Some(false));
        assert!(list.state);
        assert_eq!(list.substate, Substate::Normal);

        power
            .apply(&board(), PowerAction::On, ComponentSelector::Full)
            .await
            .unwrap();
        assert_eq!(power.list(&board()).await.unwrap().substate, Substate::Full);

        power
            .apply(
                &board(),
                PowerAction::Off,
                ComponentSelector::Named("jtag".into()),
            )
            .await
            .unwrap();
        assert_eq!(power.list(&board()).await.unwrap().get("jtag"), Some(false));
    }

    #[tokio::test]
    async fn test_unknown_component_and_target() {
        let (power, _) = controller(rail_target(&[("relay", None)], Duration::ZERO));
        let err = power
            .apply(&board(), PowerAction::On, ComponentSelector::Named("nope".into()))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let err = power.list(&TargetId::new("ghost")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test(start_paused = true)]
    async fn test_list_waits_for_inflight_cycle() {
        let (power, _) = controller(rail_target(
            &[("relay", None), ("dut", None)],
            Duration::from_secs(10),
        ));
        let power = Arc::new(power);

        let start = tokio::time::Instant::now();
        let cycling = {
            let power = Arc::clone(&power);
            tokio::spawn(async move {
                power
                    .apply(&board(), PowerAction::Cycle, ComponentSelector::All)
                    .await
            })
        };
        // Let the cycle reach its settle delay
        tokio::time::sleep(Duration::from_secs(1)).await;

        let list = power.list(&board()).await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(10));
        assert!(list.state);
        assert_eq!(list.substate, Substate::Full);
        assert!(cycling.await.unwrap().unwrap().is_success());
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_driver_times_out() {
        let (power, _) = controller(rail_target(&[("hung-relay", None)], Duration::ZERO));
        let report = power
            .apply(&board(), PowerAction::On, ComponentSelector::All)
            .await
            .unwrap();
        assert!(matches!(
            report.outcome("hung-relay", PowerAction::On),
            Some(OutcomeStatus::Failed { reason }) if reason.contains("Timed out")
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sequence_stops_at_failure() {
        let (power, _) = controller(rail_target(
            &[("relay", None), ("bad-dut", Some(Explicit::Both))],
            Duration::ZERO,
        ));
        let steps = vec![
            "on:relay".parse().unwrap(),
            "wait:2".parse().unwrap(),
            "on:bad-dut".parse().unwrap(),
            "off:relay".parse().unwrap(),
        ];
        let start = tokio::time::Instant::now();
        let report = power.sequence(&board(), steps).await.unwrap();

        assert!(!report.completed);
        assert_eq!(report.reports.len(), 2);
        assert!(start.elapsed() >= Duration::from_secs(2));
        // The step after the failure never ran
        assert_eq!(power.list(&board()).await.unwrap().get("relay"), Some(true));
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_transaction() {
        let registry = TargetRegistry::new(vec![rail_target(
            &[("relay", None)],
            Duration::from_secs(3600),
        )]);
        let cancel = CancellationToken::new();
        let power = PowerController::new(
            &registry,
            &TestDrivers::default(),
            Duration::from_secs(60),
            cancel.clone(),
        );
        cancel.cancel();
        let err = power
            .apply(&board(), PowerAction::Cycle, ComponentSelector::All)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }
}
