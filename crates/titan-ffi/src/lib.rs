use std::ffi::{CStr, CString};
use std::os::raw::c_char;
use std::sync::{Arc, Mutex, MutexGuard};

use lazy_static::lazy_static;
use serde::Serialize;
use titan_core::inference::LocalInferenceClient;
use titan_core::models::{CoreError, SettingsHandle, TaskId, TaskParameters, TaskType};
use titan_core::orchestration::{ExecutionCoordinator, RetentionSweeper, SweeperHandle};
use titan_core::sqlite::SqliteStore;
use tokio::runtime::{Handle, Runtime};

struct TitanState {
    coordinator: ExecutionCoordinator,
    _sweeper: SweeperHandle,
    runtime: Runtime,
}

lazy_static! {
    static ref STATE: Mutex<Option<TitanState>> = Mutex::new(None);
}

fn lock_state() -> MutexGuard<'static, Option<TitanState>> {
    match STATE.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn context() -> Option<(ExecutionCoordinator, Handle)> {
    lock_state()
        .as_ref()
        .map(|state| (state.coordinator.clone(), state.runtime.handle().clone()))
}

/// Initialize the Titan engine with the given SQLite database path.
///
/// # Safety
///
/// `db_path` must be a valid, non-null pointer to a NUL-terminated UTF-8 C string.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn titan_init(db_path: *const c_char) -> bool {
    let Some(path) = (unsafe { read_str(db_path) }) else {
        return false;
    };

    let mut guard = lock_state();
    if guard.is_some() {
        return true;
    }

    titan_core::logging::init_logging();

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(error) => {
            tracing::error!(%error, "failed to create tokio runtime");
            return false;
        }
    };

    let store = Arc::new(SqliteStore::new(path));
    if let Err(error) = store.migrate_to_latest() {
        tracing::error!(message = %error.message, "failed to migrate database");
        return false;
    }

    let settings = match SettingsHandle::load_with_env(store.clone()) {
        Ok(settings) => settings,
        Err(error) => {
            tracing::error!(message = %error.message, "failed to load settings");
            return false;
        }
    };

    let inference = Arc::new(LocalInferenceClient::new());
    let loaded = runtime.block_on(async {
        let coordinator = ExecutionCoordinator::load(store, inference, settings).await?;
        let sweeper = RetentionSweeper::spawn_with_settings(coordinator.clone());
        Ok::<_, CoreError>((coordinator, sweeper))
    });
    let (coordinator, sweeper) = match loaded {
        Ok(loaded) => loaded,
        Err(error) => {
            tracing::error!(message = %error.message, "failed to load task registry");
            return false;
        }
    };

    *guard = Some(TitanState {
        coordinator,
        _sweeper: sweeper,
        runtime,
    });
    true
}

/// Create a task and start executing it. Returns the new task as JSON, or null.
///
/// # Safety
///
/// `task_type` and `description` must be valid NUL-terminated UTF-8 C strings.
/// `parameters_json` may be null; otherwise it must be a NUL-terminated JSON object.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn titan_create_task(
    task_type: *const c_char,
    description: *const c_char,
    parameters_json: *const c_char,
) -> *mut c_char {
    let Some((coordinator, handle)) = context() else {
        return std::ptr::null_mut();
    };
    let (Some(raw_type), Some(description)) =
        (unsafe { read_str(task_type) }, unsafe { read_str(description) })
    else {
        return std::ptr::null_mut();
    };

    let task_type = match raw_type.parse::<TaskType>() {
        Ok(task_type) => task_type,
        Err(error) => {
            tracing::warn!(message = %error.message, "rejected task type");
            return std::ptr::null_mut();
        }
    };
    let parameters = match unsafe { read_str(parameters_json) } {
        None => TaskParameters::new(),
        Some(raw) => match serde_json::from_str::<TaskParameters>(raw) {
            Ok(parameters) => parameters,
            Err(error) => {
                tracing::warn!(%error, "rejected task parameters");
                return std::ptr::null_mut();
            }
        },
    };

    match handle.block_on(coordinator.create_task(task_type, description, parameters)) {
        Ok(task) => to_json(&task),
        Err(error) => {
            tracing::error!(message = %error.message, "failed to create task");
            std::ptr::null_mut()
        }
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn titan_execute_task(task_id: u64) -> bool {
    run(|coordinator| async move { coordinator.execute(TaskId(task_id)).await })
}

#[unsafe(no_mangle)]
pub extern "C" fn titan_cancel_task(task_id: u64) -> bool {
    run(|coordinator| async move { coordinator.cancel(TaskId(task_id)).await })
}

#[unsafe(no_mangle)]
pub extern "C" fn titan_retry_task(task_id: u64) -> bool {
    run(|coordinator| async move { coordinator.retry(TaskId(task_id)).await })
}

#[unsafe(no_mangle)]
pub extern "C" fn titan_delete_task(task_id: u64) -> bool {
    run(|coordinator| async move { coordinator.delete_task(TaskId(task_id)).await })
}

#[unsafe(no_mangle)]
pub extern "C" fn titan_clear_tasks() -> bool {
    run(|coordinator| async move { coordinator.clear_all().await })
}

/// Focus a task; `0` clears the focus.
#[unsafe(no_mangle)]
pub extern "C" fn titan_set_current_task(task_id: u64) -> bool {
    let focus = (task_id != 0).then_some(TaskId(task_id));
    run(|coordinator| async move { coordinator.set_current_task(focus).await })
}

#[unsafe(no_mangle)]
pub extern "C" fn titan_list_tasks() -> *mut c_char {
    query(|coordinator| async move { to_json(&coordinator.tasks().await) })
}

#[unsafe(no_mangle)]
pub extern "C" fn titan_running_tasks() -> *mut c_char {
    query(|coordinator| async move { to_json(&coordinator.running_tasks().await) })
}

#[unsafe(no_mangle)]
pub extern "C" fn titan_task_statistics() -> *mut c_char {
    query(|coordinator| async move { to_json(&coordinator.statistics().await) })
}

#[unsafe(no_mangle)]
pub extern "C" fn titan_registry_state() -> *mut c_char {
    query(|coordinator| async move { to_json(&coordinator.snapshot().await) })
}

/// Store the backend API key; null or blank clears it.
///
/// # Safety
///
/// `api_key` must be null or a valid NUL-terminated UTF-8 C string.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn titan_set_api_key(api_key: *const c_char) -> bool {
    let Some((coordinator, _)) = context() else {
        return false;
    };
    let api_key = unsafe { read_str(api_key) }
        .map(str::trim)
        .filter(|key| !key.is_empty())
        .map(str::to_string);

    match coordinator
        .settings()
        .modify(|settings| settings.api_key = api_key)
    {
        Ok(()) => true,
        Err(error) => {
            tracing::error!(message = %error.message, "failed to save api key");
            false
        }
    }
}

/// Free a string previously returned by a `titan_*` function.
///
/// # Safety
///
/// `s` must be a pointer previously returned by a `titan_*` function, or null.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn titan_free_string(s: *mut c_char) {
    if s.is_null() {
        return;
    }
    unsafe {
        let _ = CString::from_raw(s);
    }
}

fn run<F, Fut>(operation: F) -> bool
where
    F: FnOnce(ExecutionCoordinator) -> Fut,
    Fut: Future<Output = Result<(), CoreError>>,
{
    let Some((coordinator, handle)) = context() else {
        return false;
    };
    match handle.block_on(operation(coordinator)) {
        Ok(()) => true,
        Err(error) => {
            tracing::warn!(
                task_id = error.task.map(|task_id| task_id.0),
                kind = ?error.kind,
                message = %error.message,
                "titan operation failed"
            );
            false
        }
    }
}

fn query<F, Fut>(operation: F) -> *mut c_char
where
    F: FnOnce(ExecutionCoordinator) -> Fut,
    Fut: Future<Output = *mut c_char>,
{
    match context() {
        Some((coordinator, handle)) => handle.block_on(operation(coordinator)),
        None => std::ptr::null_mut(),
    }
}

fn to_json<T: Serialize>(value: &T) -> *mut c_char {
    let Ok(json) = serde_json::to_string(value) else {
        return std::ptr::null_mut();
    };
    match CString::new(json) {
        Ok(c) => c.into_raw(),
        Err(_) => std::ptr::null_mut(),
    }
}

/// # Safety
///
/// `ptr` must be null or point to a NUL-terminated C string that outlives `'a`.
unsafe fn read_str<'a>(ptr: *const c_char) -> Option<&'a str> {
    if ptr.is_null() {
        return None;
    }
    unsafe { CStr::from_ptr(ptr) }.to_str().ok()
}
