//! Shared wasmtime execution primitive.
//!
//! `agora-access` (executable contracts) and `agora-sandbox` (artifact code)
//! both need to compile untrusted guest modules, bound their execution by
//! fuel and wall-clock, and exchange JSON payloads with them over a small
//! ptr/len ABI. This crate factors that out so neither depends on the
//! other -- the design notes call for the `SIGALRM` hack in the original
//! to become "a watchdog task + cooperative cancellation"; fuel consumption
//! plus an outer `tokio::time::timeout` is that watchdog.
//!
//! ABI: a guest module exports `alloc(len: i32) -> i32`, optionally
//! `dealloc(ptr: i32, len: i32)`, and one or more entry points of shape
//! `(ptr: i32, len: i32) -> i64`, where the input is a JSON payload written
//! into guest memory at `ptr..ptr+len` and the i64 return packs
//! `(result_ptr << 32) | result_len` addressing a JSON response, also in
//! guest memory.

use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use wasmtime::{AsContextMut, Caller, Engine, Instance, Linker, Memory, Module, Store, TypedFunc};

#[derive(Debug, Error)]
pub enum WasmError {
    #[error("module failed to compile: {0}")]
    Compile(String),
    #[error("instantiation failed: {0}")]
    Instantiate(String),
    #[error("missing required export '{0}'")]
    MissingExport(String),
    #[error("guest module has no exported linear memory")]
    MissingMemory,
    #[error("call to '{0}' trapped: {1}")]
    Trap(String, String),
    #[error("execution exceeded its wall-clock bound")]
    Timeout,
    #[error("payload was not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// A compiled, not-yet-instantiated guest module plus its original source
/// text (kept for the entry-point detection convention).
pub struct CompiledModule {
    pub module: Module,
    pub source: String,
}

impl CompiledModule {
    /// Whether the source text declares the given export, by the same
    /// "scan for a top-level declaration" convention the original executor
    /// used for `def handle_request(`.
    pub fn declares(&self, export_name: &str) -> bool {
        self.module.exports().any(|e| e.name() == export_name)
    }
}

/// Engine wrapper configured for fuel-bounded, async-capable execution.
pub struct WasmRuntime {
    engine: Engine,
}

impl WasmRuntime {
    pub fn new() -> Result<Self, WasmError> {
        let mut config = wasmtime::Config::new();
        config.async_support(true);
        config.consume_fuel(true);
        let engine = Engine::new(&config).map_err(|e| WasmError::Compile(e.to_string()))?;
        Ok(Self { engine })
    }

    /// Compile a guest module. Accepts either WASM binary bytes or WAT text
    /// (wasmtime auto-detects and transcodes WAT), matching how the
    /// original stored artifact `code` as plain source text.
    pub fn compile(&self, source: &str) -> Result<CompiledModule, WasmError> {
        let module = Module::new(&self.engine, source).map_err(|e| WasmError::Compile(e.to_string()))?;
        Ok(CompiledModule {
            module,
            source: source.to_string(),
        })
    }

    /// Instantiate `module` with `store_data` as the store's associated
    /// data, call `export_name(payload)`, and decode the JSON response.
    /// `configure_linker` wires in whatever host functions the caller's
    /// guest ABI needs (kernel syscalls, a read-only ledger view, ...).
    pub async fn call_json<T: Send + 'static>(
        &self,
        module: &CompiledModule,
        store_data: T,
        configure_linker: impl FnOnce(&mut Linker<T>) -> Result<(), WasmError>,
        export_name: &str,
        payload: &Value,
        fuel: u64,
        timeout: Duration,
    ) -> Result<Value, WasmError> {
        let mut store = Store::new(&self.engine, store_data);
        store
            .set_fuel(fuel)
            .map_err(|e| WasmError::Instantiate(e.to_string()))?;

        let mut linker = Linker::new(&self.engine);
        configure_linker(&mut linker)?;

        let instantiate = linker.instantiate_async(&mut store, &module.module);
        let instance = tokio::time::timeout(timeout, instantiate)
            .await
            .map_err(|_| WasmError::Timeout)?
            .map_err(|e| WasmError::Instantiate(e.to_string()))?;

        let call = Self::invoke(&mut store, &instance, export_name, payload);
        let result = tokio::time::timeout(timeout, call).await.map_err(|_| WasmError::Timeout)??;
        Ok(result)
    }

    async fn invoke<T: Send>(
        store: &mut Store<T>,
        instance: &Instance,
        export_name: &str,
        payload: &Value,
    ) -> Result<Value, WasmError> {
        let memory = instance
            .get_memory(&mut *store, "memory")
            .ok_or(WasmError::MissingMemory)?;

        let input_bytes = serde_json::to_vec(payload)?;
        let input_ptr = write_guest_bytes(&mut *store, instance, memory, &input_bytes).await?;

        let entry: TypedFunc<(i32, i32), i64> = instance
            .get_typed_func(&mut *store, export_name)
            .map_err(|_| WasmError::MissingExport(export_name.to_string()))?;

        let packed = entry
            .call_async(&mut *store, (input_ptr, input_bytes.len() as i32))
            .await
            .map_err(|e| WasmError::Trap(export_name.to_string(), e.to_string()))?;

        let (result_ptr, result_len) = unpack(packed);
        let bytes = read_guest_bytes(store, memory, result_ptr, result_len)?;
        let value = serde_json::from_slice(&bytes)?;
        Ok(value)
    }
}

impl Default for WasmRuntime {
    fn default() -> Self {
        Self::new().expect("wasmtime engine configuration is always valid")
    }
}

async fn write_guest_bytes<T: Send>(
    store: &mut Store<T>,
    instance: &Instance,
    memory: Memory,
    bytes: &[u8],
) -> Result<i32, WasmError> {
    let alloc: TypedFunc<i32, i32> = instance
        .get_typed_func(&mut *store, "alloc")
        .map_err(|_| WasmError::MissingExport("alloc".to_string()))?;
    let ptr = alloc
        .call_async(&mut *store, bytes.len() as i32)
        .await
        .map_err(|e| WasmError::Trap("alloc".to_string(), e.to_string()))?;
    memory
        .write(store.as_context_mut(), ptr as usize, bytes)
        .map_err(|e| WasmError::Trap("alloc".to_string(), e.to_string()))?;
    Ok(ptr)
}

fn read_guest_bytes<T>(store: &mut Store<T>, memory: Memory, ptr: i32, len: i32) -> Result<Vec<u8>, WasmError> {
    let mut buf = vec![0u8; len as usize];
    memory
        .read(store.as_context_mut(), ptr as usize, &mut buf)
        .map_err(|e| WasmError::Trap("read result".to_string(), e.to_string()))?;
    Ok(buf)
}

fn unpack(packed: i64) -> (i32, i32) {
    let ptr = (packed >> 32) as i32;
    let len = (packed & 0xFFFF_FFFF) as i32;
    (ptr, len)
}

/// Helper for host functions that need to return a JSON value to the guest
/// using the same ptr/len packing convention, writing into the *caller's*
/// memory from within a linker-registered host function.
pub fn host_return_json<T>(mut caller: Caller<'_, T>, value: &Value) -> Result<i64, WasmError> {
    let memory = caller
        .get_export("memory")
        .and_then(|e| e.into_memory())
        .ok_or(WasmError::MissingMemory)?;
    let alloc = caller
        .get_export("alloc")
        .and_then(|e| e.into_func())
        .ok_or_else(|| WasmError::MissingExport("alloc".to_string()))?
        .typed::<i32, i32>(&caller)
        .map_err(|e| WasmError::Instantiate(e.to_string()))?;

    let bytes = serde_json::to_vec(value)?;
    let ptr = alloc
        .call(&mut caller, bytes.len() as i32)
        .map_err(|e| WasmError::Trap("alloc".to_string(), e.to_string()))?;
    memory
        .write(&mut caller, ptr as usize, &bytes)
        .map_err(|e| WasmError::Trap("host_return_json".to_string(), e.to_string()))?;
    Ok(((ptr as i64) << 32) | bytes.len() as i64)
}

/// Helper for host functions to read a JSON payload the guest passed by
/// ptr/len, from within a linker-registered host function.
pub fn host_read_json<T>(mut caller: Caller<'_, T>, ptr: i32, len: i32) -> Result<Value, WasmError> {
    let memory = caller
        .get_export("memory")
        .and_then(|e| e.into_memory())
        .ok_or(WasmError::MissingMemory)?;
    let mut buf = vec![0u8; len as usize];
    memory
        .read(&mut caller, ptr as usize, &mut buf)
        .map_err(|e| WasmError::Trap("host_read_json".to_string(), e.to_string()))?;
    Ok(serde_json::from_slice(&buf)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    const ADD_WAT: &str = r#"
        (module
            (memory (export "memory") 1)
            (global $heap (mut i32) (i32.const 1024))
            (func (export "alloc") (param $len i32) (result i32)
                (local $ptr i32)
                global.get $heap
                local.set $ptr
                global.get $heap
                local.get $len
                i32.add
                global.set $heap
                local.get $ptr)
            (func (export "run") (param $ptr i32) (param $len i32) (result i64)
                ;; ignores the JSON input entirely and always answers "7"
                (local $out i32)
                i32.const 2048
                local.set $out
                local.get $out
                i32.const 55  ;; ascii '7'
                i32.store8
                local.get $out
                i64.extend_i32_u
                i64.const 32
                i64.shl
                i64.const 1
                i64.or))
    "#;

    #[tokio::test]
    async fn detects_declared_exports() {
        let runtime = WasmRuntime::new().unwrap();
        let compiled = runtime.compile(ADD_WAT).unwrap();
        assert!(compiled.declares("run"));
        assert!(!compiled.declares("handle_request"));
    }

    #[tokio::test]
    async fn calls_exported_entry_point_and_decodes_json_result() {
        let runtime = WasmRuntime::new().unwrap();
        let compiled = runtime.compile(ADD_WAT).unwrap();

        let result = runtime
            .call_json(
                &compiled,
                (),
                |_linker| Ok(()),
                "run",
                &serde_json::json!([3, 4]),
                10_000_000,
                Duration::from_secs(1),
            )
            .await
            .unwrap();

        assert_eq!(result, serde_json::json!(7));
    }

    #[tokio::test]
    async fn missing_export_is_reported() {
        let runtime = WasmRuntime::new().unwrap();
        let compiled = runtime.compile(ADD_WAT).unwrap();

        let err = runtime
            .call_json(
                &compiled,
                (),
                |_linker| Ok(()),
                "handle_request",
                &serde_json::json!({}),
                10_000_000,
                Duration::from_secs(1),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, WasmError::MissingExport(_)));
    }
}
