//! Bounded sandbox execution of artifact code (spec §4.5).
//!
//! Every executable artifact is a compiled wasm guest module. Wasm's own
//! memory isolation already gives us "no filesystem, no network, no
//! import of arbitrary modules" for free -- the restricted-builtins
//! whitelist the Python original enforced at the AST level becomes, here,
//! "only the host functions this executor chooses to link are callable
//! at all". `time` and `random` are the only two sources of
//! nondeterminism an artifact could otherwise reach for, so they are the
//! only entries in `allowed_imports` this crate actually gates; `math`
//! and `json` are guest-local concerns with nothing to link.
//!
//! Two entry-point conventions (spec §4.5): a `run` export, called
//! positionally, or a `handle_request` export, called with
//! `(caller, operation, args)`. Detection here is by the module's
//! *export table* rather than a source-text scan for `def handle_request(`
//! -- the Rust-native equivalent of the same convention, since wasm
//! modules don't carry Python source.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use agora_access::AccessControl;
use agora_artifacts::ArtifactStore;
use agora_eventlog::EventLog;
use agora_kernel::{KernelActions, KernelState};
use agora_llmgate::{ChatMessage, LlmGateway};
use agora_types::{Artifact, EventType};
use agora_wasmrt::{host_read_json, host_return_json, CompiledModule, WasmError, WasmRuntime};
use rand::Rng;
use serde_json::{json, Value};
use thiserror::Error;
use wasmtime::Linker;

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("artifact '{0}' has no code to execute")]
    NoCode(String),
    #[error("artifact does not declare a run or handle_request entry point")]
    NoEntryPoint,
    #[error(transparent)]
    Wasm(#[from] WasmError),
}

/// The `{success, result?, error?}` shape every call resolves to (spec
/// §4.5). Constructed only by this crate -- callers never see a bare
/// `WasmError` escape, matching spec §7's "the sandbox never leaks host
/// exceptions" propagation rule.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq)]
pub struct ExecutionResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ExecutionResult {
    fn ok(result: Value) -> Self {
        Self { success: true, result: Some(result), error: None }
    }

    fn err(error: impl Into<String>) -> Self {
        Self { success: false, result: None, error: Some(error.into()) }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryPoint {
    Run,
    HandleRequest,
}

/// Per-call state handed to wasmtime as the `Store`'s associated data.
/// Guest code can only reach the host functions registered against it --
/// there is no ambient way to forge `caller_id` or reach another
/// principal's balance from inside the sandbox.
struct GuestContext {
    caller_id: String,
    kernel_state: Arc<KernelState>,
    kernel_actions: Arc<KernelActions>,
    llm: Option<Arc<LlmGateway>>,
}

pub struct SandboxExecutor {
    wasm: Arc<WasmRuntime>,
    kernel_state: Arc<KernelState>,
    kernel_actions: Arc<KernelActions>,
    llm_gateway: Arc<LlmGateway>,
    access: Arc<AccessControl>,
    artifacts: Arc<ArtifactStore>,
    event_log: Arc<EventLog>,
    allowed_imports: Vec<String>,
    timeout: Duration,
    fuel: u64,
    module_cache: tokio::sync::RwLock<HashMap<String, Arc<CompiledModule>>>,
}

impl SandboxExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        wasm: Arc<WasmRuntime>,
        kernel_state: Arc<KernelState>,
        kernel_actions: Arc<KernelActions>,
        llm_gateway: Arc<LlmGateway>,
        access: Arc<AccessControl>,
        artifacts: Arc<ArtifactStore>,
        event_log: Arc<EventLog>,
        allowed_imports: Vec<String>,
        timeout: Duration,
        fuel: u64,
    ) -> Self {
        Self {
            wasm,
            kernel_state,
            kernel_actions,
            llm_gateway,
            access,
            artifacts,
            event_log,
            allowed_imports,
            timeout,
            fuel,
            module_cache: tokio::sync::RwLock::new(HashMap::new()),
        }
    }

    /// Compiles and caches `artifact`'s code, or returns the cached
    /// module if its code hasn't changed since last compiled (the cache
    /// key doubles as the content fingerprint: we recompile whenever the
    /// stored code string differs).
    async fn compiled(&self, artifact: &Artifact) -> Result<Arc<CompiledModule>, SandboxError> {
        let code = artifact.code.as_deref().ok_or_else(|| SandboxError::NoCode(artifact.id.clone()))?;
        if let Some(cached) = self.module_cache.read().await.get(&artifact.id) {
            if cached.source == code {
                return Ok(cached.clone());
            }
        }
        let compiled = Arc::new(self.wasm.compile(code)?);
        self.module_cache.write().await.insert(artifact.id.clone(), compiled.clone());
        Ok(compiled)
    }

    /// Validates that `code` compiles and declares at least one of the
    /// two entry-point conventions.
    pub fn validate(&self, code: &str) -> Result<EntryPoint, SandboxError> {
        let compiled = self.wasm.compile(code)?;
        self.detect_entry_point(&compiled, None)
    }

    fn detect_entry_point(
        &self,
        compiled: &CompiledModule,
        genesis_methods: Option<&HashMap<String, String>>,
    ) -> Result<EntryPoint, SandboxError> {
        if genesis_methods.is_some() {
            // Genesis artifacts dispatch through registered method
            // handlers, never through handle_request (spec §4.5).
            return Err(SandboxError::NoEntryPoint);
        }
        if compiled.declares("handle_request") {
            Ok(EntryPoint::HandleRequest)
        } else if compiled.declares("run") {
            Ok(EntryPoint::Run)
        } else {
            Err(SandboxError::NoEntryPoint)
        }
    }

    /// Calls `artifact`'s `run(*args)` entry point as `artifact`'s own
    /// principal (artifact loops invoke their own code as themselves).
    pub async fn execute_run(&self, artifact: &Artifact, args: Vec<Value>) -> ExecutionResult {
        self.execute(artifact, &artifact.created_by, EntryPoint::Run, json!(args)).await
    }

    /// Calls `artifact`'s `handle_request(caller, operation, args)` entry
    /// point on behalf of `caller`, which becomes the `caller_id` exposed
    /// to the guest and the principal kernel actions are verified against.
    pub async fn execute_handle_request(
        &self,
        artifact: &Artifact,
        caller: &str,
        operation: Option<&str>,
        args: Vec<Value>,
    ) -> ExecutionResult {
        let payload = json!({
            "caller": caller,
            "operation": operation.unwrap_or("invoke"),
            "args": args,
        });
        self.execute(artifact, caller, EntryPoint::HandleRequest, payload).await
    }

    async fn execute(
        &self,
        artifact: &Artifact,
        caller: &str,
        requested: EntryPoint,
        payload: Value,
    ) -> ExecutionResult {
        let compiled = match self.compiled(artifact).await {
            Ok(c) => c,
            Err(e) => return ExecutionResult::err(e.to_string()),
        };

        match self.detect_entry_point(&compiled, artifact.genesis_methods.as_ref()) {
            Ok(actual) if actual == requested => {}
            Ok(other) => {
                return ExecutionResult::err(format!(
                    "artifact '{}' declares {other:?}, not the requested {requested:?}",
                    artifact.id
                ))
            }
            Err(e) => return ExecutionResult::err(e.to_string()),
        }

        let export_name = match requested {
            EntryPoint::Run => "run",
            EntryPoint::HandleRequest => "handle_request",
        };

        let context = GuestContext {
            caller_id: caller.to_string(),
            kernel_state: self.kernel_state.clone(),
            kernel_actions: self.kernel_actions.clone(),
            llm: artifact.can_call_llm().then(|| self.llm_gateway.clone()),
        };

        let allow_time = self.allowed_imports.iter().any(|m| m == "time" || m == "datetime");
        let allow_random = self.allowed_imports.iter().any(|m| m == "random");

        let result = self
            .wasm
            .call_json(
                &compiled,
                context,
                |linker| configure_linker(linker, allow_time, allow_random),
                export_name,
                &payload,
                self.fuel,
                self.timeout,
            )
            .await;

        match result {
            Ok(value) => ExecutionResult::ok(coerce_json(value)),
            Err(WasmError::Timeout) => {
                self.event_log
                    .append(
                        EventType::ThinkingFailed,
                        json!({"artifact": artifact.id, "caller": caller, "error": "timeout"}),
                    )
                    .await;
                ExecutionResult::err("Timeout: execution exceeded its wall-clock bound")
            }
            Err(e) => ExecutionResult::err(e.to_string()),
        }
    }

    pub fn access_control(&self) -> Arc<AccessControl> {
        self.access.clone()
    }

    pub fn artifact_store(&self) -> Arc<ArtifactStore> {
        self.artifacts.clone()
    }
}

/// Already-JSON values pass through; this exists for symmetry with
/// languages where results need stringifying, matching spec §4.5's "non-
/// serialisable results are stringified" -- `serde_json::Value` is always
/// serialisable, so this is currently the identity function, kept as an
/// explicit seam rather than inlined at the one call site.
fn coerce_json(value: Value) -> Value {
    value
}

fn configure_linker(
    linker: &mut Linker<GuestContext>,
    allow_time: bool,
    allow_random: bool,
) -> Result<(), WasmError> {
    linker
        .func_wrap1_async("env", "host_caller_id", |caller: wasmtime::Caller<'_, GuestContext>, _unused: i32| {
            Box::new(async move {
                let id = caller.data().caller_id.clone();
                host_return_json(caller, &json!(id)).unwrap_or(0)
            })
        })
        .map_err(|e| WasmError::Instantiate(e.to_string()))?;

    linker
        .func_wrap2_async("env", "host_get_balance", |mut caller: wasmtime::Caller<'_, GuestContext>, ptr: i32, len: i32| {
            Box::new(async move {
                let req = match host_read_json(&mut caller, ptr, len) {
                    Ok(v) => v,
                    Err(_) => return host_return_json(caller, &json!(0)).unwrap_or(0),
                };
                let id = req.get("id").and_then(Value::as_str).unwrap_or_default().to_string();
                let kernel_state = caller.data().kernel_state.clone();
                let balance = kernel_state.get_balance(&id).await;
                host_return_json(caller, &json!(balance)).unwrap_or(0)
            })
        })
        .map_err(|e| WasmError::Instantiate(e.to_string()))?;

    linker
        .func_wrap2_async("env", "host_get_resource", |mut caller: wasmtime::Caller<'_, GuestContext>, ptr: i32, len: i32| {
            Box::new(async move {
                let req = match host_read_json(&mut caller, ptr, len) {
                    Ok(v) => v,
                    Err(_) => return host_return_json(caller, &json!(0)).unwrap_or(0),
                };
                let id = req.get("id").and_then(Value::as_str).unwrap_or_default().to_string();
                let resource = req.get("resource").and_then(Value::as_str).unwrap_or_default().to_string();
                let kernel_state = caller.data().kernel_state.clone();
                let amount = kernel_state.get_resource(&id, &resource).await;
                host_return_json(caller, &json!(amount)).unwrap_or(0)
            })
        })
        .map_err(|e| WasmError::Instantiate(e.to_string()))?;

    linker
        .func_wrap2_async("env", "host_get_artifact_metadata", |mut caller: wasmtime::Caller<'_, GuestContext>, ptr: i32, len: i32| {
            Box::new(async move {
                let req = match host_read_json(&mut caller, ptr, len) {
                    Ok(v) => v,
                    Err(_) => return host_return_json(caller, &Value::Null).unwrap_or(0),
                };
                let id = req.get("id").and_then(Value::as_str).unwrap_or_default().to_string();
                let kernel_state = caller.data().kernel_state.clone();
                let meta = kernel_state.get_artifact_metadata(&id).await;
                host_return_json(caller, &json!(meta)).unwrap_or(0)
            })
        })
        .map_err(|e| WasmError::Instantiate(e.to_string()))?;

    linker
        .func_wrap2_async("env", "host_read_artifact", |mut caller: wasmtime::Caller<'_, GuestContext>, ptr: i32, len: i32| {
            Box::new(async move {
                let req = match host_read_json(&mut caller, ptr, len) {
                    Ok(v) => v,
                    Err(_) => return host_return_json(caller, &Value::Null).unwrap_or(0),
                };
                let id = req.get("id").and_then(Value::as_str).unwrap_or_default().to_string();
                let kernel_state = caller.data().kernel_state.clone();
                let caller_id = caller.data().caller_id.clone();
                let artifact = kernel_state.read_artifact(&id, &caller_id).await;
                host_return_json(caller, &json!(artifact)).unwrap_or(0)
            })
        })
        .map_err(|e| WasmError::Instantiate(e.to_string()))?;

    linker
        .func_wrap2_async("env", "host_transfer_scrip", |mut caller: wasmtime::Caller<'_, GuestContext>, ptr: i32, len: i32| {
            Box::new(async move {
                let req = match host_read_json(&mut caller, ptr, len) {
                    Ok(v) => v,
                    Err(e) => return host_return_json(caller, &json!({"ok": false, "error": e.to_string()})).unwrap_or(0),
                };
                let to = req.get("to").and_then(Value::as_str).unwrap_or_default().to_string();
                let amount = req.get("amount").and_then(Value::as_i64).unwrap_or(0);
                let kernel_actions = caller.data().kernel_actions.clone();
                let caller_id = caller.data().caller_id.clone();
                let outcome = kernel_actions.transfer_scrip(&caller_id, &to, amount).await;
                let response = match outcome {
                    Ok(()) => json!({"ok": true}),
                    Err(e) => json!({"ok": false, "error": e.to_string()}),
                };
                host_return_json(caller, &response).unwrap_or(0)
            })
        })
        .map_err(|e| WasmError::Instantiate(e.to_string()))?;

    linker
        .func_wrap2_async("env", "host_transfer_resource", |mut caller: wasmtime::Caller<'_, GuestContext>, ptr: i32, len: i32| {
            Box::new(async move {
                let req = match host_read_json(&mut caller, ptr, len) {
                    Ok(v) => v,
                    Err(e) => return host_return_json(caller, &json!({"ok": false, "error": e.to_string()})).unwrap_or(0),
                };
                let to = req.get("to").and_then(Value::as_str).unwrap_or_default().to_string();
                let resource = req.get("resource").and_then(Value::as_str).unwrap_or_default().to_string();
                let amount = req.get("amount").and_then(Value::as_i64).unwrap_or(0);
                let kernel_actions = caller.data().kernel_actions.clone();
                let caller_id = caller.data().caller_id.clone();
                let outcome = kernel_actions.transfer_resource(&caller_id, &to, &resource, amount).await;
                let response = match outcome {
                    Ok(()) => json!({"ok": true}),
                    Err(e) => json!({"ok": false, "error": e.to_string()}),
                };
                host_return_json(caller, &response).unwrap_or(0)
            })
        })
        .map_err(|e| WasmError::Instantiate(e.to_string()))?;

    linker
        .func_wrap2_async("env", "host_create_principal", |mut caller: wasmtime::Caller<'_, GuestContext>, ptr: i32, len: i32| {
            Box::new(async move {
                let req = match host_read_json(&mut caller, ptr, len) {
                    Ok(v) => v,
                    Err(e) => return host_return_json(caller, &json!({"ok": false, "error": e.to_string()})).unwrap_or(0),
                };
                let id = req.get("id").and_then(Value::as_str).unwrap_or_default().to_string();
                let starting_scrip = req.get("starting_scrip").and_then(Value::as_i64).unwrap_or(0);
                let kernel_actions = caller.data().kernel_actions.clone();
                let caller_id = caller.data().caller_id.clone();
                let outcome = kernel_actions.create_principal(&caller_id, &id, starting_scrip).await;
                let response = match outcome {
                    Ok(()) => json!({"ok": true}),
                    Err(e) => json!({"ok": false, "error": e.to_string()}),
                };
                host_return_json(caller, &response).unwrap_or(0)
            })
        })
        .map_err(|e| WasmError::Instantiate(e.to_string()))?;

    linker
        .func_wrap2_async("env", "host_syscall_llm", |mut caller: wasmtime::Caller<'_, GuestContext>, ptr: i32, len: i32| {
            Box::new(async move {
                let Some(gateway) = caller.data().llm.clone() else {
                    return host_return_json(
                        &mut caller,
                        &json!({"success": false, "cost": 0.0, "error": "artifact lacks can_call_llm capability"}),
                    )
                    .unwrap_or(0);
                };
                let req = match host_read_json(&mut caller, ptr, len) {
                    Ok(v) => v,
                    Err(e) => {
                        return host_return_json(
                            &mut caller,
                            &json!({"success": false, "cost": 0.0, "error": e.to_string()}),
                        )
                        .unwrap_or(0)
                    }
                };
                let model = req.get("model").and_then(Value::as_str).unwrap_or_default().to_string();
                let messages: Vec<ChatMessage> = req
                    .get("messages")
                    .and_then(|v| serde_json::from_value(v.clone()).ok())
                    .unwrap_or_default();
                let caller_id = caller.data().caller_id.clone();
                let result = gateway.syscall_llm(&caller_id, &model, &messages).await;
                host_return_json(caller, &json!(result)).unwrap_or(0)
            })
        })
        .map_err(|e| WasmError::Instantiate(e.to_string()))?;

    if allow_time {
        linker
            .func_wrap("env", "host_time_now", || -> f64 {
                SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs_f64()
            })
            .map_err(|e| WasmError::Instantiate(e.to_string()))?;
    }

    if allow_random {
        linker
            .func_wrap("env", "host_random", || -> f64 { rand::thread_rng().gen_range(0.0..1.0) })
            .map_err(|e| WasmError::Instantiate(e.to_string()))?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use agora_types::IdRegistry;

    struct EchoProvider;

    #[async_trait::async_trait]
    impl agora_llmgate::LlmProvider for EchoProvider {
        async fn complete(
            &self,
            _model: &str,
            _messages: &[ChatMessage],
        ) -> Result<agora_llmgate::LlmResponse, agora_llmgate::LlmProviderError> {
            Ok(agora_llmgate::LlmResponse {
                content: "ok".to_string(),
                usage: agora_llmgate::LlmUsage::default(),
            })
        }
    }

    fn new_executor() -> (SandboxExecutor, Arc<ArtifactStore>) {
        let registry = Arc::new(IdRegistry::new());
        let event_log = Arc::new(EventLog::in_memory());
        let ledger = Arc::new(agora_ledger::Ledger::new(registry.clone(), event_log.clone()));
        let artifacts = Arc::new(ArtifactStore::new(registry, event_log.clone()));
        let wasm = Arc::new(WasmRuntime::new().unwrap());
        let access = Arc::new(AccessControl::new(ledger.clone(), wasm.clone(), 10));
        let kernel_state = Arc::new(KernelState::new(ledger.clone(), artifacts.clone(), access.clone()));
        let kernel_actions = Arc::new(KernelActions::new(ledger.clone(), event_log.clone()));
        let llm_gateway = Arc::new(LlmGateway::new(
            ledger,
            event_log.clone(),
            Arc::new(EchoProvider),
            agora_config::LlmConfig::default(),
            Arc::new(agora_llmgate::ApiCostTracker::new()),
        ));

        let executor = SandboxExecutor::new(
            wasm,
            kernel_state,
            kernel_actions,
            llm_gateway,
            access,
            artifacts.clone(),
            event_log,
            vec!["math".to_string(), "json".to_string()],
            Duration::from_secs(2),
            50_000_000,
        );
        (executor, artifacts)
    }

    const RUN_WAT: &str = r#"
        (module
            (memory (export "memory") 1)
            (global $heap (mut i32) (i32.const 1024))
            (func (export "alloc") (param $len i32) (result i32)
                global.get $heap
                global.get $heap local.get $len i32.add global.set $heap)
            (func (export "run") (param $ptr i32) (param $len i32) (result i64)
                (local $out i32)
                i32.const 2048 local.set $out
                local.get $out i32.const 55 i32.store8
                local.get $out i64.extend_i32_u i64.const 32 i64.shl i64.const 1 i64.or))
    "#;

    #[tokio::test]
    async fn execute_run_invokes_declared_entry_point() {
        let (executor, artifacts) = new_executor();
        artifacts
            .write_unchecked(agora_artifacts::WriteRequest {
                id: "calc".into(),
                created_by: "alice".into(),
                content: "".into(),
                code: Some(RUN_WAT.to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        let artifact = artifacts.get("calc").await.unwrap();

        let result = executor.execute_run(&artifact, vec![]).await;
        assert!(result.success);
        assert_eq!(result.result, Some(json!(7)));
    }

    #[tokio::test]
    async fn requesting_the_wrong_entry_point_fails_cleanly() {
        let (executor, artifacts) = new_executor();
        artifacts
            .write_unchecked(agora_artifacts::WriteRequest {
                id: "calc".into(),
                created_by: "alice".into(),
                content: "".into(),
                code: Some(RUN_WAT.to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        let artifact = artifacts.get("calc").await.unwrap();

        let result = executor.execute_handle_request(&artifact, "bob", None, vec![]).await;
        assert!(!result.success);
    }

    #[tokio::test]
    async fn genesis_dispatch_artifacts_never_use_the_sandbox() {
        let (executor, _) = new_executor();
        let artifact = Artifact {
            genesis_methods: Some(HashMap::from([("ping".to_string(), "replies pong".to_string())])),
            code: Some(RUN_WAT.to_string()),
            ..Artifact::new("genesis-1", "system", "")
        };
        let result = executor.execute_run(&artifact, vec![]).await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("entry point"));
    }
}
