//! In-memory platform and engine used by the unit tests

use crate::engine::capability::{InterfaceUpdateListener, PlatformCapability};
use crate::engine::{Engine, EngineError, EngineFactory, EnginePaths};
use crate::platform::{
    CallbackRegistration, DefaultNetworkCallback, NetworkCapabilities, NetworkId, PlatformError,
    TunnelBuilder, TunnelDevice, VpnPlatform,
};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::net::IpAddr;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlatformCall {
    Session(String),
    Mtu(u32),
    Address(IpAddr, u8),
    Route(IpAddr, u8),
    Dns(IpAddr),
    ExcludeSelf,
    Establish(i32),
    Close(i32),
    Protect(i32),
    Bind(Option<NetworkId>),
    Underlying(Option<Vec<NetworkId>>),
    Register(CallbackRegistration),
    Unregister(CallbackRegistration),
}

#[derive(Default)]
struct PlatformState {
    calls: Vec<PlatformCall>,
    open_devices: usize,
    next_fd: i32,
    next_registration: u64,
    callbacks: BTreeMap<u64, Arc<dyn DefaultNetworkCallback>>,
    capabilities: HashMap<NetworkId, NetworkCapabilities>,
    active_network: Option<NetworkId>,
    fail_builder_steps: bool,
    fail_establish: bool,
    fail_network_calls: bool,
    fail_callback_registration: bool,
}

/// Records every OS call and panics if two tunnel devices are ever open.
pub struct FakePlatform {
    state: Arc<Mutex<PlatformState>>,
}

impl FakePlatform {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Arc::new(Mutex::new(PlatformState {
                next_fd: 100,
                next_registration: 1,
                ..PlatformState::default()
            })),
        })
    }

    fn with<R>(&self, f: impl FnOnce(&mut PlatformState) -> R) -> R {
        f(&mut self.state.lock().unwrap())
    }

    pub fn calls(&self) -> Vec<PlatformCall> {
        self.with(|s| s.calls.clone())
    }

    pub fn open_devices(&self) -> usize {
        self.with(|s| s.open_devices)
    }

    pub fn registered_callbacks(&self) -> usize {
        self.with(|s| s.callbacks.len())
    }

    pub fn last_callback(&self) -> Option<Arc<dyn DefaultNetworkCallback>> {
        self.with(|s| s.callbacks.values().next_back().cloned())
    }

    pub fn fail_builder_steps(&self, fail: bool) {
        self.with(|s| s.fail_builder_steps = fail);
    }

    pub fn fail_establish(&self, fail: bool) {
        self.with(|s| s.fail_establish = fail);
    }

    pub fn fail_network_calls(&self, fail: bool) {
        self.with(|s| s.fail_network_calls = fail);
    }

    pub fn fail_callback_registration(&self, fail: bool) {
        self.with(|s| s.fail_callback_registration = fail);
    }

    pub fn set_active_network(&self, network: Option<NetworkId>) {
        self.with(|s| s.active_network = network);
    }

    pub fn set_capabilities(&self, network: NetworkId, capabilities: NetworkCapabilities) {
        self.with(|s| {
            s.capabilities.insert(network, capabilities);
        });
    }

    pub fn callbacks(&self) -> Vec<Arc<dyn DefaultNetworkCallback>> {
        self.with(|s| s.callbacks.values().cloned().collect())
    }

    pub fn emit_available(&self, network: NetworkId) {
        for callback in self.callbacks() {
            callback.on_available(network);
        }
    }

    pub fn emit_lost(&self, network: NetworkId) {
        for callback in self.callbacks() {
            callback.on_lost(network);
        }
    }

    pub fn emit_capabilities(&self, network: NetworkId, capabilities: NetworkCapabilities) {
        for callback in self.callbacks() {
            callback.on_capabilities_changed(network, capabilities);
        }
    }

    fn network_call(&self, call: PlatformCall, what: &'static str) -> Result<(), PlatformError> {
        self.with(|s| {
            s.calls.push(call);
            if s.fail_network_calls {
                Err(PlatformError::Unsupported(what))
            } else {
                Ok(())
            }
        })
    }
}

impl VpnPlatform for FakePlatform {
    fn tunnel_builder(&self) -> Box<dyn TunnelBuilder> {
        Box::new(FakeBuilder {
            state: self.state.clone(),
        })
    }

    fn protect(&self, fd: i32) -> Result<(), PlatformError> {
        self.network_call(PlatformCall::Protect(fd), "protect")
    }

    fn bind_process_to_network(&self, network: Option<NetworkId>) -> Result<(), PlatformError> {
        self.network_call(PlatformCall::Bind(network), "bind")
    }

    fn set_underlying_networks(&self, networks: Option<&[NetworkId]>) -> Result<(), PlatformError> {
        self.network_call(
            PlatformCall::Underlying(networks.map(|n| n.to_vec())),
            "underlying networks",
        )
    }

    fn active_network(&self) -> Option<NetworkId> {
        self.with(|s| s.active_network)
    }

    fn network_capabilities(&self, network: NetworkId) -> Option<NetworkCapabilities> {
        self.with(|s| s.capabilities.get(&network).copied())
    }

    fn register_default_network_callback(
        &self,
        callback: Arc<dyn DefaultNetworkCallback>,
    ) -> Result<CallbackRegistration, PlatformError> {
        self.with(|s| {
            if s.fail_callback_registration {
                return Err(PlatformError::Unsupported("network callbacks"));
            }
            let id = s.next_registration;
            s.next_registration += 1;
            s.callbacks.insert(id, callback);
            let registration = CallbackRegistration(id);
            s.calls.push(PlatformCall::Register(registration));
            Ok(registration)
        })
    }

    fn unregister_network_callback(&self, registration: CallbackRegistration) -> Result<(), PlatformError> {
        self.with(|s| {
            s.calls.push(PlatformCall::Unregister(registration));
            s.callbacks.remove(&registration.0);
            Ok(())
        })
    }
}

struct FakeBuilder {
    state: Arc<Mutex<PlatformState>>,
}

impl FakeBuilder {
    fn step(&self, call: PlatformCall) -> Result<(), PlatformError> {
        let mut s = self.state.lock().unwrap();
        s.calls.push(call);
        if s.fail_builder_steps {
            Err(PlatformError::Unsupported("builder step"))
        } else {
            Ok(())
        }
    }
}

impl TunnelBuilder for FakeBuilder {
    fn set_session(&mut self, session: &str) {
        self.state
            .lock()
            .unwrap()
            .calls
            .push(PlatformCall::Session(session.to_string()));
    }

    fn set_mtu(&mut self, mtu: u32) {
        self.state.lock().unwrap().calls.push(PlatformCall::Mtu(mtu));
    }

    fn add_address(&mut self, address: IpAddr, prefix: u8) -> Result<(), PlatformError> {
        self.step(PlatformCall::Address(address, prefix))
    }

    fn add_route(&mut self, address: IpAddr, prefix: u8) -> Result<(), PlatformError> {
        self.step(PlatformCall::Route(address, prefix))
    }

    fn add_dns_server(&mut self, server: IpAddr) -> Result<(), PlatformError> {
        self.step(PlatformCall::Dns(server))
    }

    fn exclude_self(&mut self) -> Result<(), PlatformError> {
        self.step(PlatformCall::ExcludeSelf)
    }

    fn establish(self: Box<Self>) -> Result<Box<dyn TunnelDevice>, PlatformError> {
        let mut s = self.state.lock().unwrap();
        if s.fail_establish {
            return Err(PlatformError::Device("establish refused".to_string()));
        }
        assert_eq!(s.open_devices, 0, "a second tunnel device was opened");
        let fd = s.next_fd;
        s.next_fd += 1;
        s.open_devices += 1;
        s.calls.push(PlatformCall::Establish(fd));
        Ok(Box::new(FakeDevice {
            state: self.state.clone(),
            fd,
            closed: false,
        }))
    }
}

struct FakeDevice {
    state: Arc<Mutex<PlatformState>>,
    fd: i32,
    closed: bool,
}

impl TunnelDevice for FakeDevice {
    fn fd(&self) -> i32 {
        self.fd
    }

    fn close(&mut self) -> Result<(), PlatformError> {
        if !self.closed {
            self.closed = true;
            let mut s = self.state.lock().unwrap();
            s.open_devices -= 1;
            s.calls.push(PlatformCall::Close(self.fd));
        }
        Ok(())
    }
}

impl Drop for FakeDevice {
    fn drop(&mut self) {
        if !self.closed {
            if let Ok(mut s) = self.state.lock() {
                s.open_devices -= 1;
            }
        }
    }
}

/// Listener that keeps every update it receives
#[derive(Default)]
pub struct RecordingListener {
    updates: Mutex<Vec<(String, i32, bool, bool)>>,
}

impl RecordingListener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn updates(&self) -> Vec<(String, i32, bool, bool)> {
        self.updates.lock().unwrap().clone()
    }
}

impl InterfaceUpdateListener for RecordingListener {
    fn update_default_interface(
        &self,
        interface_name: &str,
        interface_index: i32,
        is_expensive: bool,
        is_constrained: bool,
    ) -> Result<(), EngineError> {
        self.updates.lock().unwrap().push((
            interface_name.to_string(),
            interface_index,
            is_expensive,
            is_constrained,
        ));
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineCall {
    Setup,
    Validate { cached: bool },
    NewSession { cached: bool },
    Start,
    Pause,
    Close,
    ResetNetwork,
    UpdateWifiState,
}

#[derive(Default)]
struct EngineScript {
    calls: Vec<EngineCall>,
    start_results: VecDeque<Result<(), String>>,
    validation_failure: Option<String>,
    service_error: Option<String>,
    service_error_clears: usize,
    needs_wifi: bool,
    fail_runtime_calls: bool,
    skip_interface_monitor: bool,
    fds_at_start: Vec<i32>,
    setup_paths: Option<EnginePaths>,
}

/// Engine library stand-in with scripted start results.
///
/// A started engine asks the capability for the tunnel descriptor and starts
/// interface monitoring with [`FakeEngineFactory::listener`], like the real
/// engine does.
pub struct FakeEngineFactory {
    script: Arc<Mutex<EngineScript>>,
    listener: Arc<RecordingListener>,
}

impl FakeEngineFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            script: Arc::new(Mutex::new(EngineScript::default())),
            listener: RecordingListener::new(),
        })
    }

    fn with<R>(&self, f: impl FnOnce(&mut EngineScript) -> R) -> R {
        f(&mut self.script.lock().unwrap())
    }

    pub fn calls(&self) -> Vec<EngineCall> {
        self.with(|s| s.calls.clone())
    }

    pub fn listener(&self) -> Arc<RecordingListener> {
        self.listener.clone()
    }

    /// Queue the result of the next `start`. Unscripted starts succeed.
    pub fn push_start_result(&self, result: Result<(), &str>) {
        self.with(|s| s.start_results.push_back(result.map_err(str::to_string)));
    }

    pub fn fail_validation_once(&self, message: &str) {
        self.with(|s| s.validation_failure = Some(message.to_string()));
    }

    pub fn set_service_error(&self, message: Option<&str>) {
        self.with(|s| s.service_error = message.map(str::to_string));
    }

    pub fn service_error_clears(&self) -> usize {
        self.with(|s| s.service_error_clears)
    }

    pub fn set_needs_wifi(&self, needs: bool) {
        self.with(|s| s.needs_wifi = needs);
    }

    pub fn fail_runtime_calls(&self, fail: bool) {
        self.with(|s| s.fail_runtime_calls = fail);
    }

    /// Engine starts without ever asking for an interface monitor
    pub fn skip_interface_monitor(&self, skip: bool) {
        self.with(|s| s.skip_interface_monitor = skip);
    }

    pub fn fds_at_start(&self) -> Vec<i32> {
        self.with(|s| s.fds_at_start.clone())
    }

    pub fn setup_paths(&self) -> Option<EnginePaths> {
        self.with(|s| s.setup_paths.clone())
    }
}

fn caching_enabled(document: &str) -> bool {
    serde_json::from_str::<serde_json::Value>(document)
        .ok()
        .and_then(|v| v.pointer("/experimental/cache_file/enabled")?.as_bool())
        .unwrap_or(false)
}

impl EngineFactory for FakeEngineFactory {
    fn setup(&self, paths: &EnginePaths) -> Result<(), EngineError> {
        self.with(|s| {
            s.calls.push(EngineCall::Setup);
            s.setup_paths = Some(paths.clone());
        });
        Ok(())
    }

    fn validate(&self, document: &str) -> Result<(), EngineError> {
        self.with(|s| {
            s.calls.push(EngineCall::Validate {
                cached: caching_enabled(document),
            });
            match s.validation_failure.take() {
                Some(message) => Err(EngineError::new(message)),
                None => Ok(()),
            }
        })
    }

    fn new_session(
        &self,
        document: &str,
        capability: Arc<dyn PlatformCapability>,
    ) -> Result<Box<dyn Engine>, EngineError> {
        self.with(|s| {
            s.calls.push(EngineCall::NewSession {
                cached: caching_enabled(document),
            })
        });
        Ok(Box::new(FakeEngine {
            script: self.script.clone(),
            capability,
            listener: self.listener.clone(),
        }))
    }

    fn last_service_error(&self) -> Option<String> {
        self.with(|s| s.service_error.clone())
    }

    fn clear_service_error(&self) {
        self.with(|s| {
            s.service_error = None;
            s.service_error_clears += 1;
        });
    }
}

struct FakeEngine {
    script: Arc<Mutex<EngineScript>>,
    capability: Arc<dyn PlatformCapability>,
    listener: Arc<RecordingListener>,
}

impl FakeEngine {
    fn runtime_call(&self, call: EngineCall) -> Result<(), EngineError> {
        let mut s = self.script.lock().unwrap();
        s.calls.push(call);
        if s.fail_runtime_calls {
            Err(EngineError::new("engine call failed"))
        } else {
            Ok(())
        }
    }
}

impl Engine for FakeEngine {
    fn start(&self) -> Result<(), EngineError> {
        let fd = self.capability.supply_tunnel_fd();
        let (result, monitor) = {
            let mut s = self.script.lock().unwrap();
            s.calls.push(EngineCall::Start);
            s.fds_at_start.push(fd);
            let result = s.start_results.pop_front().unwrap_or(Ok(()));
            (result, !s.skip_interface_monitor)
        };
        match result {
            Ok(()) => {
                if monitor {
                    self.capability.start_interface_monitor(self.listener.clone());
                }
                Ok(())
            }
            Err(message) => Err(EngineError::new(message)),
        }
    }

    fn pause(&self) -> Result<(), EngineError> {
        self.runtime_call(EngineCall::Pause)
    }

    fn close(&self) -> Result<(), EngineError> {
        self.capability.stop_interface_monitor(self.listener.clone());
        self.runtime_call(EngineCall::Close)
    }

    fn reset_network(&self) -> Result<(), EngineError> {
        self.runtime_call(EngineCall::ResetNetwork)
    }

    fn needs_wifi_state(&self) -> bool {
        self.script.lock().unwrap().needs_wifi
    }

    fn update_wifi_state(&self) -> Result<(), EngineError> {
        self.runtime_call(EngineCall::UpdateWifiState)
    }
}
