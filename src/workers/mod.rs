//! A fixed pool of persistent worker threads, and the fork/join barrier that
//! hands them work.
//!
//! The pool is built once, with exactly one thread per worklet. Each dispatch
//! broadcasts one [`WorkTag`] to every worklet at once: the producer builds one
//! [`WorkUnit`] per worklet, hands each to a pool thread along with exclusive
//! access to its worklet, then blocks until every worklet has reported back
//! over a channel. Pool threads park between dispatches.

pub mod worklet;

use crossbeam_channel::{unbounded, Receiver, Sender};
use log::{debug, trace};
use rayon::{Scope, ThreadPool, ThreadPoolBuilder};

pub use worklet::{ResamplerWorklet, WorkTag, WorkUnit, WorkletReport, WorkletState};

use crate::{constants::WORKLET_THREAD_PREFIX, conv_func::CfSource, types::GridFloat, ResamplerError};

/// What a worklet sends back over the coordinator's channel.
pub type WorkletResult = Result<WorkletReport, ResamplerError>;

/// Owns the worker threads, and dispatches work to them.
#[derive(Debug)]
pub struct ThreadCoordinator {
    pool: Option<ThreadPool>,
    num_threads: usize,
}

impl ThreadCoordinator {
    /// Build a pool of `num_threads` persistent threads.
    ///
    /// # Errors
    ///
    /// Will return [`ResamplerError::ThreadPool`] if the threads can't be
    /// spawned.
    pub fn new(num_threads: usize) -> Result<Self, ResamplerError> {
        trace!("start ThreadCoordinator::new({})", num_threads);
        let pool = ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .thread_name(|idx| format!("{WORKLET_THREAD_PREFIX}-{idx}"))
            .build()?;
        trace!("end ThreadCoordinator::new");
        Ok(Self {
            pool: Some(pool),
            num_threads,
        })
    }

    /// The number of threads in the pool
    pub fn num_threads(&self) -> usize {
        self.num_threads
    }

    /// True once [`ThreadCoordinator::terminate`] has been called
    pub fn is_terminated(&self) -> bool {
        self.pool.is_none()
    }

    /// Give `units[i]` to `worklets[i]`, and wait for all of them to finish.
    ///
    /// The caller's thread blocks until every worklet has reported. Reports
    /// are returned in worklet order.
    ///
    /// # Errors
    ///
    /// Will return [`ResamplerError::PoolTerminated`] after
    /// [`ThreadCoordinator::terminate`], [`ResamplerError::BadArrayShape`] if
    /// there isn't exactly one unit per worklet, and otherwise the first error
    /// reported by a worklet.
    pub fn dispatch<F, S>(
        &self,
        worklets: &mut [ResamplerWorklet<F>],
        units: Vec<WorkUnit<F>>,
        cfs: &S,
    ) -> Result<Vec<WorkletReport>, ResamplerError>
    where
        F: GridFloat,
        S: CfSource + ?Sized,
    {
        if self.is_terminated() {
            return Err(ResamplerError::PoolTerminated);
        }
        if units.len() != worklets.len() {
            return Err(ResamplerError::BadArrayShape {
                argument: "units".to_string(),
                function: "ThreadCoordinator::dispatch".to_string(),
                expected: format!("one unit per worklet ({})", worklets.len()),
                received: format!("{}", units.len()),
            });
        }
        let tag = units.first().map(WorkUnit::tag);
        trace!("start dispatch {:?} to {} worklets", tag, worklets.len());

        let job = |worklet: &mut ResamplerWorklet<F>, unit| worklet.run(unit, cfs);
        let reports = self.broadcast(worklets, units, &job)?;

        for report in &reports {
            debug!(
                "worklet {} finished {} of {} rows in {:?}",
                report.worklet_idx, report.tag, report.num_rows, report.duration
            );
        }
        trace!("end dispatch");
        Ok(reports)
    }

    /// Run `op` with the pool's threads available to any parallel iterators
    /// it uses.
    ///
    /// # Errors
    ///
    /// Will return [`ResamplerError::PoolTerminated`] after
    /// [`ThreadCoordinator::terminate`].
    pub fn install<OP, R>(&self, op: OP) -> Result<R, ResamplerError>
    where
        OP: FnOnce() -> R + Send,
        R: Send,
    {
        let pool = self.pool.as_ref().ok_or(ResamplerError::PoolTerminated)?;
        Ok(pool.install(op))
    }

    /// Tell every worklet to quit, then shut down the pool's threads.
    ///
    /// Does nothing if the pool has already been terminated.
    ///
    /// # Errors
    ///
    /// Will return an error if a worklet couldn't be told to quit. The pool
    /// is shut down regardless.
    pub fn terminate<F: GridFloat>(
        &mut self,
        worklets: &mut [ResamplerWorklet<F>],
    ) -> Result<(), ResamplerError> {
        if self.is_terminated() {
            return Ok(());
        }
        trace!("start terminate");
        let units = vec![(); worklets.len()];
        let job = |worklet: &mut ResamplerWorklet<F>, _: ()| -> WorkletResult { Ok(worklet.quit()) };
        let result = self.broadcast(worklets, units, &job);
        // dropping the pool joins its threads once they are idle
        self.pool = None;
        trace!("end terminate");
        result.map(|_| ())
    }

    /// Hand `units[i]` to `worklets[i]`, each on its own task in `scope`.
    ///
    /// Every unit is built before any worklet starts, and each worklet has
    /// exclusive access to its own state until it reports back on `tx`.
    pub fn give_work_to_workers<'scope, F, T, J>(
        &self,
        scope: &Scope<'scope>,
        worklets: &'scope mut [ResamplerWorklet<F>],
        units: Vec<T>,
        job: &'scope J,
        tx: &Sender<WorkletResult>,
    ) where
        F: GridFloat,
        T: Send + 'scope,
        J: Fn(&mut ResamplerWorklet<F>, T) -> WorkletResult + Sync,
    {
        for (worklet, unit) in worklets.iter_mut().zip(units) {
            let tx = tx.clone();
            scope.spawn(move |_| {
                // the receiver only hangs up once the dispatch is over
                let _ = tx.send(job(worklet, unit));
            });
        }
    }

    /// Block until `num_worklets` worklets have reported on `rx`, or every
    /// sender has gone. Reports come back in worklet order.
    ///
    /// # Errors
    ///
    /// Will return the first error a worklet reported.
    pub fn wait_for_workers_to_finish_task(
        &self,
        rx: &Receiver<WorkletResult>,
        num_worklets: usize,
    ) -> Result<Vec<WorkletReport>, ResamplerError> {
        let mut reports = rx
            .iter()
            .take(num_worklets)
            .collect::<Result<Vec<_>, _>>()?;
        reports.sort_by_key(|report| report.worklet_idx);
        Ok(reports)
    }

    /// Run `job` once per worklet on the pool, blocking until all are done.
    fn broadcast<F, T, J>(
        &self,
        worklets: &mut [ResamplerWorklet<F>],
        units: Vec<T>,
        job: &J,
    ) -> Result<Vec<WorkletReport>, ResamplerError>
    where
        F: GridFloat,
        T: Send,
        J: Fn(&mut ResamplerWorklet<F>, T) -> WorkletResult + Sync,
    {
        let pool = self.pool.as_ref().ok_or(ResamplerError::PoolTerminated)?;
        let num_worklets = worklets.len();
        pool.in_place_scope(|scope| {
            let (tx, rx) = unbounded();
            self.give_work_to_workers(scope, worklets, units, job, &tx);
            // a worklet which panics drops its sender, which must end the wait
            drop(tx);
            self.wait_for_workers_to_finish_task(&rx, num_worklets)
        })
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashSet, sync::Arc, thread};

    use crossbeam_channel::unbounded;

    use super::{ThreadCoordinator, WorkTag, WorkUnit, WorkletResult, WorkletState};
    use crate::{
        config::{ChannelMap, PolMap, ResamplerConfigBuilder},
        constants::WORKLET_THREAD_PREFIX,
        conv_func::CfTable,
        ndarray::Array1,
        workers::ResamplerWorklet,
        Complex, ResamplerError, VisBuffer,
    };

    fn get_test_worklets(num_worklets: usize) -> Vec<ResamplerWorklet<f64>> {
        let config = Arc::new(
            ResamplerConfigBuilder::default()
                .uvw_scale([1.0, 1.0, 0.0])
                .offset([2.0, 2.0, 0.0])
                .chan_map(ChannelMap::identity(1))
                .pol_map(PolMap::identity(1))
                .build()
                .unwrap(),
        );
        (0..num_worklets)
            .map(|idx| ResamplerWorklet::new(idx, config.clone(), (4, 4, 1, 1)))
            .collect()
    }

    #[test]
    fn test_dispatch_reaches_every_worklet() {
        let num_worklets = 4;
        let coordinator = ThreadCoordinator::new(num_worklets).unwrap();
        assert_eq!(coordinator.num_threads(), num_worklets);
        let mut worklets = get_test_worklets(num_worklets);
        let mut rows = VisBuffer::new_blank(1, Array1::from(vec![1e8]), 10);
        rows.vis.fill(Complex::new(1.0, 0.0));
        let cf = CfTable::single_tap(1e8, 1, 1);

        let units = rows
            .view()
            .scatter(num_worklets)
            .into_iter()
            .map(|rows| WorkUnit::Grid {
                rows,
                do_psf: false,
            })
            .collect();
        let reports = coordinator.dispatch(&mut worklets, units, &cf).unwrap();

        assert_eq!(reports.len(), num_worklets);
        for (idx, report) in reports.iter().enumerate() {
            assert_eq!(report.worklet_idx, idx);
            assert_eq!(report.tag, WorkTag::Grid);
        }
        assert_eq!(reports.iter().map(|r| r.num_rows).sum::<usize>(), 10);
        // the last worklet absorbs the remainder
        assert_eq!(reports[3].num_rows, 4);
        assert_eq!(worklets[3].sumwt()[(0, 0)], 4.0);
        assert!(worklets
            .iter()
            .all(|worklet| worklet.state() == WorkletState::WaitingForWork));
    }

    #[test]
    fn test_give_work_then_wait_reports_in_worklet_order() {
        let coordinator = ThreadCoordinator::new(3).unwrap();
        let mut worklets = get_test_worklets(3);
        let job = |worklet: &mut ResamplerWorklet<f64>, _: ()| -> WorkletResult { Ok(worklet.quit()) };

        let reports = {
            let (coordinator, worklets, job) = (&coordinator, worklets.as_mut_slice(), &job);
            rayon::in_place_scope(move |scope| {
                let (tx, rx) = unbounded();
                coordinator.give_work_to_workers(scope, worklets, vec![(); 3], job, &tx);
                drop(tx);
                coordinator.wait_for_workers_to_finish_task(&rx, 3)
            })
        }
        .unwrap();

        assert_eq!(
            reports.iter().map(|r| r.worklet_idx).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
        assert!(reports.iter().all(|r| r.tag == WorkTag::Quit));
        assert!(worklets
            .iter()
            .all(|worklet| worklet.state() == WorkletState::Terminated));
    }

    #[test]
    fn test_wait_returns_a_worklet_error() {
        let coordinator = ThreadCoordinator::new(2).unwrap();
        let mut worklets = get_test_worklets(2);
        let job = |worklet: &mut ResamplerWorklet<f64>, _: ()| -> WorkletResult {
            if worklet.idx() == 1 {
                Err(ResamplerError::PoolTerminated)
            } else {
                Ok(worklet.quit())
            }
        };

        let result = {
            let (coordinator, worklets, job) = (&coordinator, worklets.as_mut_slice(), &job);
            rayon::in_place_scope(move |scope| {
                let (tx, rx) = unbounded();
                coordinator.give_work_to_workers(scope, worklets, vec![(); 2], job, &tx);
                drop(tx);
                coordinator.wait_for_workers_to_finish_task(&rx, 2)
            })
        };
        assert!(matches!(result, Err(ResamplerError::PoolTerminated)));
    }

    #[test]
    fn test_work_runs_on_named_pool_threads() {
        let coordinator = ThreadCoordinator::new(2).unwrap();
        let names: HashSet<String> = coordinator
            .install(|| {
                rayon::broadcast(|_| thread::current().name().unwrap_or_default().to_string())
            })
            .unwrap()
            .into_iter()
            .collect();
        assert_eq!(names.len(), 2);
        assert!(names
            .iter()
            .all(|name| name.starts_with(WORKLET_THREAD_PREFIX)));
    }

    #[test]
    fn test_dispatch_needs_one_unit_per_worklet() {
        let coordinator = ThreadCoordinator::new(2).unwrap();
        let mut worklets = get_test_worklets(2);
        let cf = CfTable::single_tap(1e8, 1, 1);
        assert!(matches!(
            coordinator.dispatch(&mut worklets, vec![WorkUnit::Quit], &cf),
            Err(ResamplerError::BadArrayShape { .. })
        ));
    }

    #[test]
    fn test_terminate() {
        let mut coordinator = ThreadCoordinator::new(2).unwrap();
        let mut worklets = get_test_worklets(2);
        let cf = CfTable::single_tap(1e8, 1, 1);

        coordinator.terminate(&mut worklets).unwrap();
        assert!(coordinator.is_terminated());
        assert!(worklets
            .iter()
            .all(|worklet| worklet.state() == WorkletState::Terminated));
        // terminating twice is harmless
        coordinator.terminate(&mut worklets).unwrap();

        let units = vec![WorkUnit::Quit, WorkUnit::Quit];
        assert!(matches!(
            coordinator.dispatch(&mut worklets, units, &cf),
            Err(ResamplerError::PoolTerminated)
        ));
        assert!(matches!(
            coordinator.install(|| ()),
            Err(ResamplerError::PoolTerminated)
        ));
    }
}
