// ============================================================================
// ONNX RUNTIME: dynamically loaded inference backend
// ============================================================================
//
// `libloading` opens onnxruntime.dll / libonnxruntime.so / .dylib at runtime,
// so the binary has NO compile-time dependency on ONNX Runtime. The user
// points Settings at the library; everything else goes through the C API
// vtable returned by `OrtGetApiBase()->GetApi()`.
//
// Ownership: one `OrtRuntime` (library + API table + environment) per loaded
// model, shared by its sessions through an `Arc`. Sessions keep the runtime
// alive; the environment is released before the library is unloaded.

#![allow(unsafe_op_in_unsafe_fn)]

use std::ffi::{CStr, CString, c_char, c_void};
use std::path::Path;
use std::sync::Arc;

/// Errors raised while loading or running ONNX Runtime.
#[derive(Debug, Clone, PartialEq)]
pub enum OnnxError {
    DllNotFound(String),
    DllLoadFailed(String),
    ModelNotFound(String),
    ModelLoadFailed(String),
    ApiInitFailed(String),
    SessionCreateFailed(String),
    ProviderUnavailable(String),
    InferenceFailed(String),
    InvalidOutput(String),
}

impl std::fmt::Display for OnnxError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OnnxError::DllNotFound(p) => write!(f, "ONNX Runtime library not found: {}", p),
            OnnxError::DllLoadFailed(e) => write!(f, "Failed to load ONNX Runtime library: {}", e),
            OnnxError::ModelNotFound(p) => write!(f, "ONNX model file not found: {}", p),
            OnnxError::ModelLoadFailed(e) => write!(f, "Failed to load ONNX model: {}", e),
            OnnxError::ApiInitFailed(e) => write!(f, "ONNX Runtime API init failed: {}", e),
            OnnxError::SessionCreateFailed(e) => write!(f, "Failed to create ONNX session: {}", e),
            OnnxError::ProviderUnavailable(e) => write!(f, "Execution provider unavailable: {}", e),
            OnnxError::InferenceFailed(e) => write!(f, "ONNX inference failed: {}", e),
            OnnxError::InvalidOutput(e) => write!(f, "Invalid ONNX output: {}", e),
        }
    }
}

impl std::error::Error for OnnxError {}

impl From<OnnxError> for crate::error::SegmentError {
    fn from(e: OnnxError) -> Self {
        match e {
            OnnxError::InferenceFailed(_) | OnnxError::InvalidOutput(_) => {
                crate::error::SegmentError::Inference(e.to_string())
            }
            _ => crate::error::SegmentError::ModelUnavailable(e.to_string()),
        }
    }
}

// --- ONNX Runtime C API types --------------------------------------
// Opaque handles from onnxruntime_c_api.h, only ever used behind pointers.

#[repr(C)]
struct OrtEnv {
    _private: [u8; 0],
}
#[repr(C)]
struct OrtSession {
    _private: [u8; 0],
}
#[repr(C)]
struct OrtSessionOptions {
    _private: [u8; 0],
}
#[repr(C)]
struct OrtValue {
    _private: [u8; 0],
}
#[repr(C)]
struct OrtMemoryInfo {
    _private: [u8; 0],
}
#[repr(C)]
struct OrtStatus {
    _private: [u8; 0],
}
#[repr(C)]
struct OrtRunOptions {
    _private: [u8; 0],
}
#[repr(C)]
struct OrtAllocator {
    _private: [u8; 0],
}
#[repr(C)]
struct OrtTensorTypeAndShapeInfo {
    _private: [u8; 0],
}

/// API version requested from `GetApi`; available from ONNX Runtime 1.16 on.
const ORT_API_VERSION: u32 = 16;

/// Minimum supported ONNX Runtime version.
const ORT_MIN_VERSION: (u32, u32) = (1, 16);

/// ORT_ENABLE_ALL
const GRAPH_OPTIMIZATION_ALL: u32 = 99;

#[allow(dead_code)]
#[repr(u32)]
enum OrtLoggingLevel {
    Verbose = 0,
    Info = 1,
    Warning = 2,
    Error = 3,
    Fatal = 4,
}

#[allow(dead_code)]
#[repr(u32)]
enum ONNXTensorElementDataType {
    Undefined = 0,
    Float = 1,
}

#[repr(i32)]
#[allow(dead_code)]
enum OrtAllocatorType {
    Invalid = -1,
    DeviceAllocator = 0,
    ArenaAllocator = 1,
}

#[repr(i32)]
#[allow(dead_code)]
enum OrtMemType {
    CpuInput = -2,
    CpuOutput = -1,
    Default = 0,
}

#[cfg(target_os = "windows")]
type OrtChar = u16;
#[cfg(not(target_os = "windows"))]
type OrtChar = c_char;

type CreateEnvFn = unsafe extern "C" fn(
    log_level: OrtLoggingLevel,
    logid: *const c_char,
    out: *mut *mut OrtEnv,
) -> *mut OrtStatus;
type CreateSessionOptionsFn = unsafe extern "C" fn(out: *mut *mut OrtSessionOptions) -> *mut OrtStatus;
type CreateSessionFn = unsafe extern "C" fn(
    env: *const OrtEnv,
    model_path: *const OrtChar,
    options: *const OrtSessionOptions,
    out: *mut *mut OrtSession,
) -> *mut OrtStatus;
type CreateTensorWithDataAsOrtValueFn = unsafe extern "C" fn(
    info: *const OrtMemoryInfo,
    data: *mut c_void,
    data_len: usize,
    shape: *const i64,
    shape_len: usize,
    element_type: ONNXTensorElementDataType,
    out: *mut *mut OrtValue,
) -> *mut OrtStatus;
type CreateCpuMemoryInfoFn = unsafe extern "C" fn(
    alloc_type: OrtAllocatorType,
    mem_type: OrtMemType,
    out: *mut *mut OrtMemoryInfo,
) -> *mut OrtStatus;
type RunFn = unsafe extern "C" fn(
    session: *mut OrtSession,
    run_options: *const OrtRunOptions,
    input_names: *const *const c_char,
    inputs: *const *const OrtValue,
    input_count: usize,
    output_names: *const *const c_char,
    output_count: usize,
    outputs: *mut *mut OrtValue,
) -> *mut OrtStatus;
type GetTensorMutableDataFn = unsafe extern "C" fn(value: *mut OrtValue, out: *mut *mut c_void) -> *mut OrtStatus;
type GetTensorTypeAndShapeFn =
    unsafe extern "C" fn(value: *const OrtValue, out: *mut *mut OrtTensorTypeAndShapeInfo) -> *mut OrtStatus;
type GetDimensionsCountFn =
    unsafe extern "C" fn(info: *const OrtTensorTypeAndShapeInfo, out: *mut usize) -> *mut OrtStatus;
type GetDimensionsFn = unsafe extern "C" fn(
    info: *const OrtTensorTypeAndShapeInfo,
    dim_values: *mut i64,
    dim_values_length: usize,
) -> *mut OrtStatus;
type ReleaseEnvFn = unsafe extern "C" fn(env: *mut OrtEnv);
type ReleaseSessionFn = unsafe extern "C" fn(session: *mut OrtSession);
type ReleaseSessionOptionsFn = unsafe extern "C" fn(options: *mut OrtSessionOptions);
type ReleaseValueFn = unsafe extern "C" fn(value: *mut OrtValue);
type ReleaseMemoryInfoFn = unsafe extern "C" fn(info: *mut OrtMemoryInfo);
type ReleaseTensorTypeAndShapeInfoFn = unsafe extern "C" fn(info: *mut OrtTensorTypeAndShapeInfo);
type ReleaseStatusFn = unsafe extern "C" fn(status: *mut OrtStatus);
type GetErrorMessageFn = unsafe extern "C" fn(status: *const OrtStatus) -> *const c_char;
type SetIntraOpNumThreadsFn =
    unsafe extern "C" fn(options: *mut OrtSessionOptions, intra_op_num_threads: i32) -> *mut OrtStatus;
type SetSessionGraphOptimizationLevelFn =
    unsafe extern "C" fn(options: *mut OrtSessionOptions, graph_optimization_level: u32) -> *mut OrtStatus;
type SessionGetCountFn = unsafe extern "C" fn(session: *const OrtSession, out: *mut usize) -> *mut OrtStatus;
type SessionGetNameFn = unsafe extern "C" fn(
    session: *const OrtSession,
    index: usize,
    allocator: *mut OrtAllocator,
    out: *mut *mut c_char,
) -> *mut OrtStatus;
type GetAllocatorWithDefaultOptionsFn = unsafe extern "C" fn(out: *mut *mut OrtAllocator) -> *mut OrtStatus;
type AllocatorFreeFn = unsafe extern "C" fn(allocator: *mut OrtAllocator, ptr: *mut c_void) -> *mut OrtStatus;

/// Exported by GPU builds of the runtime library, absent from CPU-only builds.
type AppendCudaProviderFn = unsafe extern "C" fn(options: *mut OrtSessionOptions, device_id: i32) -> *mut OrtStatus;

/// OrtApiBase: the entry point struct returned by OrtGetApiBase()
#[repr(C)]
struct OrtApiBase {
    get_api: unsafe extern "C" fn(version: u32) -> *const c_void,
    get_version_string: unsafe extern "C" fn() -> *const c_char,
}

/// The OrtApi function-pointer table, indexed by slot.
struct OrtApi {
    raw: *const c_void,
}

impl OrtApi {
    unsafe fn get_fn<T>(&self, index: usize) -> T {
        let ptr = self.raw as *const *const c_void;
        let fn_ptr = *ptr.add(index);
        std::mem::transmute_copy(&fn_ptr)
    }

    // Slot numbers from onnxruntime_c_api.h; the first ~100 entries have
    // been frozen since the 1.x ABI was stabilised.
    //  2: GetErrorMessage   3: CreateEnv          7: CreateSession    9: Run
    // 10: CreateSessionOptions                   23: SetSessionGraphOptimizationLevel
    // 24: SetIntraOpNumThreads                   30/31: SessionGetInput/OutputCount
    // 36/37: SessionGetInput/OutputName          49: CreateTensorWithDataAsOrtValue
    // 51: GetTensorMutableData 61: GetDimensionsCount 62: GetDimensions
    // 65: GetTensorTypeAndShape 69: CreateCpuMemoryInfo 76: AllocatorFree
    // 78: GetAllocatorWithDefaultOptions
    // 92: ReleaseEnv 93: ReleaseStatus 94: ReleaseMemoryInfo 95: ReleaseSession
    // 96: ReleaseValue 99: ReleaseTensorTypeAndShapeInfo 100: ReleaseSessionOptions

    fn get_error_message(&self) -> GetErrorMessageFn {
        unsafe { self.get_fn(2) }
    }
    fn create_env(&self) -> CreateEnvFn {
        unsafe { self.get_fn(3) }
    }
    fn create_session(&self) -> CreateSessionFn {
        unsafe { self.get_fn(7) }
    }
    fn run(&self) -> RunFn {
        unsafe { self.get_fn(9) }
    }
    fn create_session_options(&self) -> CreateSessionOptionsFn {
        unsafe { self.get_fn(10) }
    }
    fn set_session_graph_optimization_level(&self) -> SetSessionGraphOptimizationLevelFn {
        unsafe { self.get_fn(23) }
    }
    fn set_intra_op_num_threads(&self) -> SetIntraOpNumThreadsFn {
        unsafe { self.get_fn(24) }
    }
    fn session_get_input_count(&self) -> SessionGetCountFn {
        unsafe { self.get_fn(30) }
    }
    fn session_get_output_count(&self) -> SessionGetCountFn {
        unsafe { self.get_fn(31) }
    }
    fn session_get_input_name(&self) -> SessionGetNameFn {
        unsafe { self.get_fn(36) }
    }
    fn session_get_output_name(&self) -> SessionGetNameFn {
        unsafe { self.get_fn(37) }
    }
    fn create_tensor_with_data(&self) -> CreateTensorWithDataAsOrtValueFn {
        unsafe { self.get_fn(49) }
    }
    fn get_tensor_mutable_data(&self) -> GetTensorMutableDataFn {
        unsafe { self.get_fn(51) }
    }
    fn get_dimensions_count(&self) -> GetDimensionsCountFn {
        unsafe { self.get_fn(61) }
    }
    fn get_dimensions(&self) -> GetDimensionsFn {
        unsafe { self.get_fn(62) }
    }
    fn get_tensor_type_and_shape(&self) -> GetTensorTypeAndShapeFn {
        unsafe { self.get_fn(65) }
    }
    fn create_cpu_memory_info(&self) -> CreateCpuMemoryInfoFn {
        unsafe { self.get_fn(69) }
    }
    fn allocator_free(&self) -> AllocatorFreeFn {
        unsafe { self.get_fn(76) }
    }
    fn get_allocator_with_default_options(&self) -> GetAllocatorWithDefaultOptionsFn {
        unsafe { self.get_fn(78) }
    }
    fn release_env(&self) -> ReleaseEnvFn {
        unsafe { self.get_fn(92) }
    }
    fn release_status(&self) -> ReleaseStatusFn {
        unsafe { self.get_fn(93) }
    }
    fn release_memory_info(&self) -> ReleaseMemoryInfoFn {
        unsafe { self.get_fn(94) }
    }
    fn release_session(&self) -> ReleaseSessionFn {
        unsafe { self.get_fn(95) }
    }
    fn release_value(&self) -> ReleaseValueFn {
        unsafe { self.get_fn(96) }
    }
    fn release_tensor_type_and_shape_info(&self) -> ReleaseTensorTypeAndShapeInfoFn {
        unsafe { self.get_fn(99) }
    }
    fn release_session_options(&self) -> ReleaseSessionOptionsFn {
        unsafe { self.get_fn(100) }
    }
}

/// Turn an OrtStatus into a Result, freeing the status. Null means success.
unsafe fn status_to_result(api: &OrtApi, status: *mut OrtStatus) -> Result<(), String> {
    if status.is_null() {
        return Ok(());
    }
    let msg_ptr = (api.get_error_message())(status);
    let msg = if msg_ptr.is_null() {
        "Unknown error".to_string()
    } else {
        CStr::from_ptr(msg_ptr).to_string_lossy().into_owned()
    };
    (api.release_status())(status);
    Err(msg)
}

/// Reject relative paths, `..` components and wrong file extensions before
/// any native code is loaded.
pub fn validate_onnx_path(path: &str, for_dll: bool) -> Result<(), OnnxError> {
    use std::path::Component;
    let p = Path::new(path);

    if path.is_empty() {
        return Err(if for_dll {
            OnnxError::DllNotFound("path is empty".to_string())
        } else {
            OnnxError::ModelNotFound("path is empty".to_string())
        });
    }
    if !p.is_absolute() {
        return Err(OnnxError::DllLoadFailed(format!("'{}' is not an absolute path", path)));
    }
    if p.components().any(|c| c == Component::ParentDir) {
        return Err(OnnxError::DllLoadFailed(format!("'{}' must not contain '..'", path)));
    }

    let ext = p
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_lowercase();
    if for_dll {
        // libonnxruntime.so.1.18.0 style names carry the version after ".so"
        let file_name = p.file_name().and_then(|n| n.to_str()).unwrap_or("");
        let versioned_so = file_name.contains(".so.");
        if !versioned_so && !["dll", "so", "dylib"].contains(&ext.as_str()) {
            return Err(OnnxError::DllLoadFailed(format!(
                "Expected a .dll/.so/.dylib file, got '.{}'",
                ext
            )));
        }
    } else if ext != "onnx" {
        return Err(OnnxError::ModelLoadFailed(format!(
            "Expected a .onnx model file, got '.{}'",
            ext
        )));
    }
    Ok(())
}

/// Parse "1.18.0" into (1, 18).
pub(crate) fn parse_ort_version(version: &str) -> Option<(u32, u32)> {
    let mut parts = version.split('.');
    let major: u32 = parts.next()?.trim().parse().ok()?;
    let minor: u32 = parts.next()?.trim().parse().ok()?;
    Some((major, minor))
}

fn check_min_version(version: &str) -> Result<(), OnnxError> {
    if let Some((major, minor)) = parse_ort_version(version) {
        let (min_major, min_minor) = ORT_MIN_VERSION;
        if major < min_major || (major == min_major && minor < min_minor) {
            return Err(OnnxError::ApiInitFailed(format!(
                "ONNX Runtime {} is too old, {}.{} or newer is required",
                version, min_major, min_minor
            )));
        }
    }
    Ok(())
}

/// Where a session's kernels run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExecutionDevice {
    Cpu,
    Cuda,
}

impl ExecutionDevice {
    pub fn label(&self) -> &'static str {
        match self {
            ExecutionDevice::Cpu => "CPU",
            ExecutionDevice::Cuda => "CUDA",
        }
    }
}

/// A loaded runtime library with its API table and logging environment.
pub struct OrtRuntime {
    api: OrtApi,
    env: *mut OrtEnv,
    version: String,
    append_cuda: Option<AppendCudaProviderFn>,
    // Dropped after `Drop::drop` has released `env`.
    _lib: libloading::Library,
}

// The OrtApi table and OrtEnv are documented as thread-safe; sessions are
// only driven from the inference worker thread.
unsafe impl Send for OrtRuntime {}
unsafe impl Sync for OrtRuntime {}

impl OrtRuntime {
    /// Load the runtime library at `dll_path` and create an environment.
    pub fn load(dll_path: &str) -> Result<Arc<Self>, OnnxError> {
        validate_onnx_path(dll_path, true)?;
        if !Path::new(dll_path).exists() {
            return Err(OnnxError::DllNotFound(dll_path.to_string()));
        }

        unsafe {
            let lib = libloading::Library::new(dll_path).map_err(|e| OnnxError::DllLoadFailed(e.to_string()))?;

            let api_base = {
                let get_api_base: libloading::Symbol<unsafe extern "C" fn() -> *const OrtApiBase> = lib
                    .get(b"OrtGetApiBase")
                    .map_err(|e| OnnxError::DllLoadFailed(format!("Symbol OrtGetApiBase not found: {}", e)))?;
                get_api_base()
            };
            if api_base.is_null() {
                return Err(OnnxError::ApiInitFailed("OrtGetApiBase returned null".to_string()));
            }

            let version_ptr = ((*api_base).get_version_string)();
            let version = if version_ptr.is_null() {
                "unknown".to_string()
            } else {
                CStr::from_ptr(version_ptr).to_string_lossy().into_owned()
            };
            check_min_version(&version)?;

            let api_ptr = ((*api_base).get_api)(ORT_API_VERSION);
            if api_ptr.is_null() {
                return Err(OnnxError::ApiInitFailed(format!(
                    "OrtGetApi({}) returned null, library version {}",
                    ORT_API_VERSION, version
                )));
            }
            let api = OrtApi { raw: api_ptr };

            let append_cuda = lib
                .get::<AppendCudaProviderFn>(b"OrtSessionOptionsAppendExecutionProvider_CUDA")
                .ok()
                .map(|sym| *sym);

            let mut env: *mut OrtEnv = std::ptr::null_mut();
            let log_id = CString::new("SegmentFE").map_err(|e| OnnxError::ApiInitFailed(e.to_string()))?;
            status_to_result(&api, (api.create_env())(OrtLoggingLevel::Warning, log_id.as_ptr(), &mut env))
                .map_err(OnnxError::ApiInitFailed)?;

            crate::log_info!(
                "ONNX Runtime {} loaded from {} (CUDA provider {})",
                version,
                dll_path,
                if append_cuda.is_some() { "exported" } else { "not exported" }
            );

            Ok(Arc::new(Self { api, env, version, append_cuda, _lib: lib }))
        }
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn has_cuda(&self) -> bool {
        self.append_cuda.is_some()
    }
}

impl Drop for OrtRuntime {
    fn drop(&mut self) {
        if !self.env.is_null() {
            unsafe { (self.api.release_env())(self.env) };
        }
    }
}

/// Load the library just long enough to read and check its version string.
pub fn probe_onnx_runtime(dll_path: &str) -> Result<String, OnnxError> {
    OrtRuntime::load(dll_path).map(|rt| rt.version().to_string())
}

/// Borrowed float input: `data.len()` must equal the product of `shape`.
pub struct TensorRef<'a> {
    pub name: &'a str,
    pub shape: Vec<i64>,
    pub data: &'a [f32],
}

/// Owned float output copied out of the runtime.
#[derive(Clone, Debug, PartialEq)]
pub struct Tensor {
    pub shape: Vec<i64>,
    pub data: Vec<f32>,
}

impl Tensor {
    pub fn dim(&self, i: usize) -> usize {
        self.shape.get(i).map_or(0, |&d| d.max(0) as usize)
    }
}

/// One loaded .onnx graph.
pub struct Session {
    runtime: Arc<OrtRuntime>,
    raw: *mut OrtSession,
    pub input_names: Vec<String>,
    pub output_names: Vec<String>,
    device: ExecutionDevice,
}

// Run() may be called from any thread; the session is owned by one worker.
unsafe impl Send for Session {}

impl Session {
    /// Create a session for `model_path`. `want_cuda` appends the CUDA
    /// provider and fails with `ProviderUnavailable` when it cannot.
    pub fn new(runtime: Arc<OrtRuntime>, model_path: &str, want_cuda: bool) -> Result<Self, OnnxError> {
        validate_onnx_path(model_path, false)?;
        if !Path::new(model_path).exists() {
            return Err(OnnxError::ModelNotFound(model_path.to_string()));
        }
        let api = &runtime.api;

        unsafe {
            let mut options: *mut OrtSessionOptions = std::ptr::null_mut();
            status_to_result(api, (api.create_session_options())(&mut options))
                .map_err(OnnxError::SessionCreateFailed)?;

            let threads = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4) as i32;
            let _ = status_to_result(api, (api.set_intra_op_num_threads())(options, threads));
            let _ = status_to_result(
                api,
                (api.set_session_graph_optimization_level())(options, GRAPH_OPTIMIZATION_ALL),
            );

            let mut device = ExecutionDevice::Cpu;
            if want_cuda {
                let appended = match runtime.append_cuda {
                    Some(append) => status_to_result(api, append(options, 0)),
                    None => Err("library was built without the CUDA provider".to_string()),
                };
                if let Err(e) = appended {
                    (api.release_session_options())(options);
                    return Err(OnnxError::ProviderUnavailable(e));
                }
                device = ExecutionDevice::Cuda;
            }

            let path_buf = encode_path(model_path)?;
            let mut raw: *mut OrtSession = std::ptr::null_mut();
            let status = (api.create_session())(runtime.env, path_buf.as_ptr(), options, &mut raw);
            (api.release_session_options())(options);
            status_to_result(api, status).map_err(OnnxError::ModelLoadFailed)?;

            let mut session = Self {
                runtime: runtime.clone(),
                raw,
                input_names: Vec::new(),
                output_names: Vec::new(),
                device,
            };
            session.input_names = session.names(true)?;
            session.output_names = session.names(false)?;
            crate::log_info!(
                "Session {} on {}: inputs {:?}, outputs {:?}",
                model_path,
                device.label(),
                session.input_names,
                session.output_names
            );
            Ok(session)
        }
    }

    pub fn device(&self) -> ExecutionDevice {
        self.device
    }

    unsafe fn names(&self, inputs: bool) -> Result<Vec<String>, OnnxError> {
        let api = &self.runtime.api;
        let mut allocator: *mut OrtAllocator = std::ptr::null_mut();
        status_to_result(api, (api.get_allocator_with_default_options())(&mut allocator))
            .map_err(|e| OnnxError::SessionCreateFailed(format!("Get allocator: {}", e)))?;

        let (count_fn, name_fn) = if inputs {
            (api.session_get_input_count(), api.session_get_input_name())
        } else {
            (api.session_get_output_count(), api.session_get_output_name())
        };
        let mut count = 0usize;
        status_to_result(api, count_fn(self.raw, &mut count))
            .map_err(|e| OnnxError::SessionCreateFailed(format!("Get name count: {}", e)))?;

        let mut names = Vec::with_capacity(count);
        for i in 0..count {
            let mut name_ptr: *mut c_char = std::ptr::null_mut();
            status_to_result(api, name_fn(self.raw, i, allocator, &mut name_ptr))
                .map_err(|e| OnnxError::SessionCreateFailed(format!("Get name {}: {}", i, e)))?;
            if name_ptr.is_null() {
                names.push(String::new());
            } else {
                names.push(CStr::from_ptr(name_ptr).to_string_lossy().into_owned());
                let _ = status_to_result(api, (api.allocator_free())(allocator, name_ptr as *mut c_void));
            }
        }
        Ok(names)
    }

    /// Run the graph on `inputs` and copy back the outputs named in `outputs`,
    /// in that order.
    pub fn run(&self, inputs: &[TensorRef<'_>], outputs: &[&str]) -> Result<Vec<Tensor>, OnnxError> {
        for input in inputs {
            let expected: i64 = input.shape.iter().product();
            if expected < 0 || expected as usize != input.data.len() {
                return Err(OnnxError::InferenceFailed(format!(
                    "input '{}' has {} values for shape {:?}",
                    input.name,
                    input.data.len(),
                    input.shape
                )));
            }
        }
        let api = &self.runtime.api;

        unsafe {
            let mut memory_info: *mut OrtMemoryInfo = std::ptr::null_mut();
            status_to_result(
                api,
                (api.create_cpu_memory_info())(OrtAllocatorType::ArenaAllocator, OrtMemType::Default, &mut memory_info),
            )
            .map_err(|e| OnnxError::InferenceFailed(format!("Create memory info: {}", e)))?;

            let mut guard = RunGuard { api, memory_info, values: Vec::new() };

            let mut input_values = Vec::with_capacity(inputs.len());
            for input in inputs {
                let mut value: *mut OrtValue = std::ptr::null_mut();
                // Input buffers are read-only to the runtime despite the *mut signature.
                status_to_result(
                    api,
                    (api.create_tensor_with_data())(
                        memory_info,
                        input.data.as_ptr() as *mut c_void,
                        std::mem::size_of_val(input.data),
                        input.shape.as_ptr(),
                        input.shape.len(),
                        ONNXTensorElementDataType::Float,
                        &mut value,
                    ),
                )
                .map_err(|e| OnnxError::InferenceFailed(format!("Create tensor '{}': {}", input.name, e)))?;
                guard.values.push(value);
                input_values.push(value as *const OrtValue);
            }

            let input_names = c_strings(inputs.iter().map(|i| i.name))?;
            let output_names = c_strings(outputs.iter().copied())?;
            let input_name_ptrs: Vec<*const c_char> = input_names.iter().map(|s| s.as_ptr()).collect();
            let output_name_ptrs: Vec<*const c_char> = output_names.iter().map(|s| s.as_ptr()).collect();
            let mut output_values: Vec<*mut OrtValue> = vec![std::ptr::null_mut(); outputs.len()];

            let status = (api.run())(
                self.raw,
                std::ptr::null(),
                input_name_ptrs.as_ptr(),
                input_values.as_ptr(),
                input_values.len(),
                output_name_ptrs.as_ptr(),
                output_values.len(),
                output_values.as_mut_ptr(),
            );
            guard.values.extend(output_values.iter().copied().filter(|v| !v.is_null()));
            status_to_result(api, status).map_err(OnnxError::InferenceFailed)?;

            output_values
                .iter()
                .zip(outputs)
                .map(|(&value, name)| copy_tensor(api, value, name))
                .collect()
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if !self.raw.is_null() {
            unsafe { (self.runtime.api.release_session())(self.raw) };
        }
    }
}

/// Releases every OrtValue and the memory info of one `Run`, on all paths.
struct RunGuard<'a> {
    api: &'a OrtApi,
    memory_info: *mut OrtMemoryInfo,
    values: Vec<*mut OrtValue>,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        unsafe {
            for &v in &self.values {
                (self.api.release_value())(v);
            }
            (self.api.release_memory_info())(self.memory_info);
        }
    }
}

unsafe fn copy_tensor(api: &OrtApi, value: *mut OrtValue, name: &str) -> Result<Tensor, OnnxError> {
    if value.is_null() {
        return Err(OnnxError::InvalidOutput(format!("output '{}' is missing", name)));
    }
    let mut info: *mut OrtTensorTypeAndShapeInfo = std::ptr::null_mut();
    status_to_result(api, (api.get_tensor_type_and_shape())(value, &mut info))
        .map_err(|e| OnnxError::InvalidOutput(format!("'{}' shape: {}", name, e)))?;
    let mut dim_count = 0usize;
    let counted = status_to_result(api, (api.get_dimensions_count())(info, &mut dim_count));
    let mut shape = vec![0i64; dim_count];
    let read = counted.and_then(|_| status_to_result(api, (api.get_dimensions())(info, shape.as_mut_ptr(), dim_count)));
    (api.release_tensor_type_and_shape_info())(info);
    read.map_err(|e| OnnxError::InvalidOutput(format!("'{}' dims: {}", name, e)))?;

    let len: usize = shape.iter().map(|&d| d.max(0) as usize).product();
    let mut data_ptr: *mut c_void = std::ptr::null_mut();
    status_to_result(api, (api.get_tensor_mutable_data())(value, &mut data_ptr))
        .map_err(|e| OnnxError::InvalidOutput(format!("'{}' data: {}", name, e)))?;
    if data_ptr.is_null() && len > 0 {
        return Err(OnnxError::InvalidOutput(format!("'{}' has no data", name)));
    }
    let data = if len == 0 {
        Vec::new()
    } else {
        std::slice::from_raw_parts(data_ptr as *const f32, len).to_vec()
    };
    Ok(Tensor { shape, data })
}

fn c_strings<'a>(names: impl Iterator<Item = &'a str>) -> Result<Vec<CString>, OnnxError> {
    names
        .map(|n| CString::new(n).map_err(|e| OnnxError::InferenceFailed(format!("bad tensor name '{}': {}", n, e))))
        .collect()
}

/// NUL-terminated model path in the platform's ORTCHAR_T encoding.
#[cfg(target_os = "windows")]
fn encode_path(path: &str) -> Result<Vec<OrtChar>, OnnxError> {
    Ok(path.encode_utf16().chain(std::iter::once(0)).collect())
}

#[cfg(not(target_os = "windows"))]
fn encode_path(path: &str) -> Result<Vec<OrtChar>, OnnxError> {
    let c = CString::new(path).map_err(|e| OnnxError::ModelLoadFailed(e.to_string()))?;
    Ok(c.as_bytes_with_nul().iter().map(|&b| b as OrtChar).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SegmentError;

    #[test]
    fn relative_and_traversal_paths_are_rejected() {
        assert!(validate_onnx_path("", true).is_err());
        assert!(validate_onnx_path("libonnxruntime.so", true).is_err());
        #[cfg(not(target_os = "windows"))]
        {
            assert!(validate_onnx_path("/opt/ort/../evil/libonnxruntime.so", true).is_err());
            assert!(validate_onnx_path("/opt/ort/lib/libonnxruntime.so", true).is_ok());
            assert!(validate_onnx_path("/opt/ort/lib/libonnxruntime.so.1.18.0", true).is_ok());
            assert!(validate_onnx_path("/opt/ort/lib/onnxruntime.txt", true).is_err());
            assert!(validate_onnx_path("/models/sam_decoder.onnx", false).is_ok());
            assert!(validate_onnx_path("/models/sam_vit_h_4b8939.pth", false).is_err());
        }
    }

    #[test]
    fn version_parsing_and_minimum() {
        assert_eq!(parse_ort_version("1.18.0"), Some((1, 18)));
        assert_eq!(parse_ort_version("garbage"), None);
        assert!(check_min_version("1.15.1").is_err());
        assert!(check_min_version("1.16.0").is_ok());
        assert!(check_min_version("2.0.0").is_ok());
    }

    #[test]
    fn missing_library_is_reported_not_panicked() {
        #[cfg(not(target_os = "windows"))]
        let path = "/nonexistent/dir/libonnxruntime.so";
        #[cfg(target_os = "windows")]
        let path = "C:\\nonexistent\\onnxruntime.dll";
        assert!(matches!(OrtRuntime::load(path).err(), Some(OnnxError::DllNotFound(_))));
    }

    #[test]
    fn load_errors_map_to_model_unavailable() {
        let e: SegmentError = OnnxError::ModelNotFound("/m.onnx".into()).into();
        assert!(matches!(e, SegmentError::ModelUnavailable(_)));
        let e: SegmentError = OnnxError::InferenceFailed("oom".into()).into();
        assert!(matches!(e, SegmentError::Inference(_)));
    }
}
