use odbc_middleware::test_utils::MemoryDriver;
use odbc_middleware::{OdbcMiddlewareError, Pool, PoolOptions, Value, create_pool};
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use tokio::runtime::Runtime;

use crate::args::SimConfig;
use crate::logging::EventLog;
use crate::model::{Health, Held, Op, TaskState, World};
use crate::oracle::Oracle;
use crate::scheduler::Scheduler;

/// Result of one step. `Err` is an expected, tolerated failure (pool exhausted, injected
/// fault); invariant violations are reported separately and end the run.
struct StepOutcome {
    result: Result<(), String>,
    conn_id: Option<u64>,
}

impl StepOutcome {
    fn ok(conn_id: Option<u64>) -> Self {
        Self {
            result: Ok(()),
            conn_id,
        }
    }

    fn tolerated(conn_id: Option<u64>, err: &OdbcMiddlewareError) -> Self {
        Self {
            result: Err(err.to_string()),
            conn_id,
        }
    }
}

pub(crate) fn run(config: SimConfig, runtime: &Runtime, rng: &mut ChaCha8Rng) -> Result<(), String> {
    let driver = MemoryDriver::new();
    let options = PoolOptions::builder()
        .minsize(config.minsize)
        .maxsize(config.pool_size)
        .finish();
    let pool = runtime
        .block_on(create_pool(driver.handle(), "DSN=simulator", options))
        .map_err(|err| format!("failed to create pool: {err}"))?;

    let mut tasks: Vec<TaskState> = (0..config.tasks).map(TaskState::new).collect();
    let mut world = World::default();
    let mut scheduler = Scheduler::new(config.tasks);
    let mut events = EventLog::new(config.first_steps, config.tail_steps);

    let max_steps = config.iterations.unwrap_or(u64::MAX);
    let max_time = config.duration_ms.unwrap_or(u64::MAX);

    let mut step: u64 = 0;
    while step < max_steps && scheduler.now_ms() <= max_time {
        let Some(task_id) = scheduler.next_ready(rng) else {
            break;
        };
        let op = next_op(&tasks[task_id], &config, rng);
        let outcome = runtime.block_on(apply(&pool, &driver, &mut world, &mut tasks[task_id], op, step));

        match outcome {
            Ok(step_outcome) => {
                if let Op::Sleep(ms) = op {
                    scheduler.sleep(task_id, ms);
                } else {
                    scheduler.mark_ready(task_id);
                }
                let result_label = match &step_outcome.result {
                    Ok(()) => "Ok".to_string(),
                    Err(err) => format!("Err({err})"),
                };
                let conn_label = step_outcome
                    .conn_id
                    .map_or_else(|| "-".to_string(), |id| id.to_string());
                events.record(format!(
                    "step={step} time={}ms task={task_id} op={op:?} conn={conn_label} result={result_label}",
                    scheduler.now_ms()
                ));
            }
            Err(reason) => {
                events.dump_failure(&reason);
                return Err(reason);
            }
        }

        if let Err(reason) = Oracle::check(&tasks, &pool, &driver) {
            events.dump_failure(&reason);
            return Err(reason);
        }
        scheduler.advance_time(1);
        step += 1;
    }

    runtime.block_on(async {
        for task in &mut tasks {
            if let Some(held) = task.held.take() {
                held.conn
                    .release()
                    .await
                    .map_err(|err| format!("final release by task {} failed: {err}", task.id))?;
            }
        }
        pool.shutdown()
            .await
            .map_err(|err| format!("shutdown failed: {err}"))
    })?;
    if let Err(reason) = Oracle::check_drained(&pool, &driver) {
        events.dump_failure(&reason);
        return Err(reason);
    }

    tracing::info!(
        "complete: steps={step} time={}ms tasks={} pool_size={} connects={}",
        scheduler.now_ms(),
        config.tasks,
        config.pool_size,
        driver.connects()
    );
    Ok(())
}

async fn apply(
    pool: &Pool,
    driver: &MemoryDriver,
    world: &mut World,
    task: &mut TaskState,
    op: Op,
    step: u64,
) -> Result<StepOutcome, String> {
    match op {
        Op::Sleep(_) => Ok(StepOutcome::ok(task.conn_id())),
        Op::ConnectFault => {
            driver.fail_next_connect();
            world.connect_fault_armed = true;
            Ok(StepOutcome::ok(task.conn_id()))
        }
        Op::Clear => {
            pool.clear().await;
            Ok(StepOutcome::ok(task.conn_id()))
        }
        Op::Checkout => checkout(pool, world, task).await,
        Op::Return => {
            let held = task
                .held
                .take()
                .ok_or_else(|| format!("task {} returned without a checkout", task.id))?;
            let conn_id = held.conn.id();
            held.conn
                .release()
                .await
                .map_err(|err| format!("release of conn {conn_id} failed: {err}"))?;
            Ok(StepOutcome::ok(Some(conn_id)))
        }
        Op::Select => {
            let held = holding(task)?;
            let expected = i64::try_from(step).unwrap_or(i64::MAX);
            let outcome = async {
                let mut cursor = held.conn.execute(&format!("SELECT {expected}"), &[]).await?;
                let value = cursor.fetch_val_or(Value::Null).await?;
                cursor.close().await?;
                Ok::<_, OdbcMiddlewareError>(value)
            }
            .await;
            match outcome {
                Ok(Value::Int(got)) if got == expected => Ok(StepOutcome::ok(Some(held.conn.id()))),
                Ok(other) => Err(format!("SELECT {expected} returned {other:?}")),
                Err(err) => expect_closed_usage(held, &err),
            }
        }
        Op::Execute => {
            let held = holding(task)?;
            let outcome = async {
                let mut cursor = held.conn.execute("UPDATE sim SET v = ?", &[Value::Int(1)]).await?;
                cursor.close().await
            }
            .await;
            match outcome {
                Ok(()) => Ok(StepOutcome::ok(Some(held.conn.id()))),
                Err(err) => expect_closed_usage(held, &err),
            }
        }
        Op::Commit | Op::Rollback => {
            let held = holding(task)?;
            let outcome = if matches!(op, Op::Commit) {
                held.conn.commit().await
            } else {
                held.conn.rollback().await
            };
            match outcome {
                Ok(()) => Ok(StepOutcome::ok(Some(held.conn.id()))),
                Err(err) => expect_closed_usage(held, &err),
            }
        }
        Op::Fail | Op::Disconnect => {
            let held = holding(task)?;
            let sql = if matches!(op, Op::Fail) { "FAIL sim" } else { "DISCONNECT" };
            match held.conn.execute(sql, &[]).await {
                Ok(_) => Err(format!("`{sql}` unexpectedly succeeded")),
                Err(err) if held.health == Health::Lost => expect_closed_usage(held, &err),
                Err(err) if err.is_driver_error() => {
                    held.health = if matches!(op, Op::Disconnect) {
                        Health::Lost
                    } else {
                        Health::Broken
                    };
                    Ok(StepOutcome::tolerated(Some(held.conn.id()), &err))
                }
                Err(err) => Err(format!("`{sql}` failed with a non-driver error: {err}")),
            }
        }
    }
}

async fn checkout(pool: &Pool, world: &mut World, task: &mut TaskState) -> Result<StepOutcome, String> {
    if task.held.is_some() {
        return Err(format!("task {} attempted double checkout", task.id));
    }
    match pool.try_acquire().await {
        Ok(conn) => {
            if conn.is_closed() || conn.is_broken() {
                return Err(format!("pool handed out unusable conn {}", conn.id()));
            }
            let conn_id = conn.id();
            task.held = Some(Held {
                conn,
                health: Health::Healthy,
            });
            Ok(StepOutcome::ok(Some(conn_id)))
        }
        Err(err @ OdbcMiddlewareError::PoolExhausted { .. }) => {
            if pool.size() < pool.maxsize() {
                return Err(format!(
                    "exhausted with size {} below maxsize {}",
                    pool.size(),
                    pool.maxsize()
                ));
            }
            Ok(StepOutcome::tolerated(None, &err))
        }
        Err(err) if err.is_driver_error() && world.connect_fault_armed => {
            world.connect_fault_armed = false;
            Ok(StepOutcome::tolerated(None, &err))
        }
        Err(err) => Err(format!("unexpected acquire error: {err}")),
    }
}

fn holding(task: &mut TaskState) -> Result<&mut Held, String> {
    let id = task.id;
    task.held
        .as_mut()
        .ok_or_else(|| format!("task {id} used a connection without a checkout"))
}

/// Only a connection that lost its link may refuse work, and only with a usage error.
fn expect_closed_usage(held: &Held, err: &OdbcMiddlewareError) -> Result<StepOutcome, String> {
    if held.health == Health::Lost && matches!(err, OdbcMiddlewareError::Usage(_)) {
        return Ok(StepOutcome::tolerated(Some(held.conn.id()), err));
    }
    Err(format!(
        "conn {} ({:?}) failed unexpectedly: {err}",
        held.conn.id(),
        held.health
    ))
}

fn next_op(task: &TaskState, config: &SimConfig, rng: &mut ChaCha8Rng) -> Op {
    if rng.random::<f64>() < config.sleep_rate {
        return Op::Sleep(rng.random_range(1..=50));
    }
    if rng.random::<f64>() < config.connect_fault_rate {
        return Op::ConnectFault;
    }
    if rng.random::<f64>() < config.clear_rate {
        return Op::Clear;
    }

    if task.held.is_none() {
        return Op::Checkout;
    }

    let weights = [
        (Op::Select, 0.30),
        (Op::Execute, 0.25),
        (Op::Commit, 0.10),
        (Op::Rollback, 0.05),
        (Op::Return, 0.20),
        (Op::Fail, config.fail_rate),
        (Op::Disconnect, config.disconnect_rate),
    ];
    choose_weighted(&weights, rng)
}

fn choose_weighted(items: &[(Op, f64)], rng: &mut ChaCha8Rng) -> Op {
    let total: f64 = items.iter().map(|(_, weight)| weight.max(0.0)).sum();
    if total <= f64::EPSILON {
        return items.first().map_or(Op::Sleep(1), |(op, _)| *op);
    }
    let mut target = rng.random::<f64>() * total;
    for (op, weight) in items {
        let w = weight.max(0.0);
        if target <= w {
            return *op;
        }
        target -= w;
    }
    items.last().map_or(Op::Sleep(1), |(op, _)| *op)
}
