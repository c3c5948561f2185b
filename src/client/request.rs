use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::bail;
use bit_set::BitSet;
use bytes::{BufMut, Bytes};
use parking_lot::Mutex;
use tracing::{debug, instrument, trace, warn};

use crate::client::channel::Channel;
use crate::client::monitor::{MonitorElement, MonitorQueue};
use crate::codec::{deserialize_bitset, serialize_bitset, serialize_full, FieldDesc, FieldRegistry, PvValue};
use crate::protocol::command::{Command, Qos};
use crate::protocol::messages::ServerMessage;
use crate::protocol::status::Status;
use crate::protocol::wire::WireBuf;
use crate::transport::send_buffer::SendBuffer;
use crate::transport::{Transport, TransportSender};
use crate::util::buf_ext::BufMutExt;

/// revision from which servers understand cancel requests
const CANCEL_MIN_REVISION: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    Get,
    Put,
    PutGet,
    Array,
    Process,
    Rpc,
    Monitor,
    /// a one-shot introspection request
    GetField,
}

impl RequestKind {
    pub fn command(self) -> Command {
        match self {
            RequestKind::Get => Command::Get,
            RequestKind::Put => Command::Put,
            RequestKind::PutGet => Command::PutGet,
            RequestKind::Array => Command::Array,
            RequestKind::Process => Command::Process,
            RequestKind::Rpc => Command::Rpc,
            RequestKind::Monitor => Command::Monitor,
            RequestKind::GetField => Command::GetField,
        }
    }

    fn supports(self, operation: Operation) -> bool {
        use Operation as O;

        match operation {
            O::Init => self != RequestKind::GetField,
            O::GetField => self == RequestKind::GetField,
            O::Get => self == RequestKind::Get,
            O::Put => self == RequestKind::Put,
            O::GetPut => matches!(self, RequestKind::Put | RequestKind::PutGet),
            O::PutGet | O::GetGet => self == RequestKind::PutGet,
            O::GetArray { .. } | O::PutArray { .. } | O::GetLength | O::SetLength { .. } => self == RequestKind::Array,
            O::Process => self == RequestKind::Process,
            O::Rpc => self == RequestKind::Rpc,
            O::Start | O::Stop => self == RequestKind::Monitor,
        }
    }
}

/// A single wire operation of a request. At most one operation is pending per request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Init,
    Get,
    Put,
    PutGet,
    /// read back the put structure's current value
    GetPut,
    /// read the get structure of a put-get request without putting
    GetGet,
    GetArray { offset: usize, count: usize, stride: usize },
    PutArray { offset: usize, stride: usize },
    GetLength,
    SetLength { length: usize },
    Process,
    Rpc,
    Start,
    Stop,
    GetField,
}

impl Operation {
    pub fn name(self) -> &'static str {
        match self {
            Operation::Init => "init",
            Operation::Get => "get",
            Operation::Put => "put",
            Operation::PutGet => "putGet",
            Operation::GetPut => "getPut",
            Operation::GetGet => "getGet",
            Operation::GetArray { .. } => "getArray",
            Operation::PutArray { .. } => "putArray",
            Operation::GetLength => "getLength",
            Operation::SetLength { .. } => "setLength",
            Operation::Process => "process",
            Operation::Rpc => "rpc",
            Operation::Start => "start",
            Operation::Stop => "stop",
            Operation::GetField => "getField",
        }
    }

    /// Initialization is replayed after a reconnect instead of failing
    pub fn is_init(self) -> bool {
        matches!(self, Operation::Init | Operation::GetField)
    }

    /// the sub-operation selector, without [Qos::DESTROY]
    pub fn qos(self, kind: RequestKind) -> Qos {
        match self {
            Operation::Init => Qos::INIT,
            Operation::GetPut if kind == RequestKind::PutGet => Qos::GET_PUT,
            Operation::GetPut | Operation::GetGet | Operation::GetArray { .. } => Qos::GET,
            Operation::GetLength => Qos::PROCESS,
            Operation::SetLength { .. } => Qos::GET_PUT,
            Operation::Start => Qos::PROCESS | Qos::GET,
            Operation::Stop => Qos::PROCESS,
            Operation::Get |
            Operation::Put |
            Operation::PutGet |
            Operation::PutArray { .. } |
            Operation::Process |
            Operation::Rpc |
            Operation::GetField => Qos::empty(),
        }
    }

    /// Monitor start / stop have no response and complete once they are sent
    fn completes_when_sent(self) -> bool {
        matches!(self, Operation::Start | Operation::Stop)
    }
}

/// What a completed operation returns. References are valid for the duration of the callback.
#[derive(Debug)]
pub enum ResponseData<'a> {
    None,
    /// `changed` is `None` if the value was transferred as a whole
    Value { value: &'a dyn PvValue, changed: Option<&'a BitSet> },
    Length(usize),
    Field(Option<&'a Arc<dyn FieldDesc>>),
}

/// The application side of a request. Callbacks are invoked without any locks held, so they
///  can start the next operation right away.
pub trait Requester: Send + Sync {
    /// Initialization completed, successfully or not. This happens again after every reconnect.
    fn request_connected(&self, request: &Arc<Request>, status: &Status, field: Option<&Arc<dyn FieldDesc>>);

    /// Every started operation completes exactly once: with the server's response, or with a
    ///  local status (cancelled, disconnected, destroyed).
    fn operation_completed(&self, request: &Arc<Request>, operation: Operation, status: &Status, data: ResponseData<'_>);

    /// New monitor elements are available
    fn monitor_event(&self, _request: &Arc<Request>) {}

    fn server_message(&self, _request: &Arc<Request>, _message: &ServerMessage) {}

    /// The channel lost its connection. The request is re-initialized when it comes back.
    fn channel_disconnected(&self, _request: &Arc<Request>) {}

    fn request_destroyed(&self, _request: &Arc<Request>) {}
}

enum Outbound {
    None,
    Value { value: Box<dyn PvValue>, changed: Option<BitSet> },
    Argument(Option<Box<dyn PvValue>>),
}

struct Pending {
    operation: Operation,
    seq: u64,
    sent: bool,
    outbound: Outbound,
    /// `false` for operations the application did not start, i.e. a monitor restart
    notify: bool,
}

#[derive(Default)]
struct RequestState {
    initialized: bool,
    destroyed: bool,
    /// the server already forgot the request, so there is no point in sending a destroy
    remotely_destroyed: bool,
    last_request: bool,
    timeout: Option<Duration>,
    pending: Option<Pending>,
    next_seq: u64,
    /// QoS of cancelled operations whose responses may still arrive, since the server does
    ///  not understand a cancel
    stale: Vec<Qos>,

    field: Option<Arc<dyn FieldDesc>>,
    value: Option<Box<dyn PvValue>>,
    /// put structure of a put-get request
    put_field: Option<Arc<dyn FieldDesc>>,
    put_value: Option<Box<dyn PvValue>>,
    monitor: Option<MonitorQueue>,
    monitor_started: bool,
}

enum Decoded {
    None,
    Changed(BitSet),
    Whole,
    Length(usize),
    RpcResult(Option<Box<dyn PvValue>>),
}

/// A request on a channel, identified by its `ioid`. It is created uninitialized; the `init`
///  operation is sent whenever its channel (re)connects, and all other operations are
///  rejected until initialization succeeded.
pub struct Request {
    ioid: u32,
    kind: RequestKind,
    channel: Weak<Channel>,
    requester: Arc<dyn Requester>,
    me: Weak<Request>,
    /// serialized once at creation, sent with every init
    pv_request: Bytes,
    sub_field: String,
    queue_size: usize,
    state: Mutex<RequestState>,
}

impl Request {
    pub(crate) fn new(
        ioid: u32,
        kind: RequestKind,
        channel: Weak<Channel>,
        requester: Arc<dyn Requester>,
        pv_request: Bytes,
        sub_field: String,
        queue_size: usize,
    ) -> Arc<Request> {
        Arc::new_cyclic(|me| Request {
            ioid,
            kind,
            channel,
            requester,
            me: me.clone(),
            pv_request,
            sub_field,
            queue_size,
            state: Default::default(),
        })
    }

    pub fn ioid(&self) -> u32 {
        self.ioid
    }

    pub fn kind(&self) -> RequestKind {
        self.kind
    }

    pub fn channel(&self) -> Option<Arc<Channel>> {
        self.channel.upgrade()
    }

    pub fn is_initialized(&self) -> bool {
        self.state.lock().initialized
    }

    pub fn is_destroyed(&self) -> bool {
        self.state.lock().destroyed
    }

    /// the operation in flight, if any
    pub fn pending_operation(&self) -> Option<Operation> {
        self.state.lock().pending.as_ref().map(|p| p.operation)
    }

    /// the type of the request's data as reported by the server during initialization
    pub fn field(&self) -> Option<Arc<dyn FieldDesc>> {
        self.state.lock().field.clone()
    }

    /// Marks the next operation as the last one: the server destroys the request after
    ///  responding, and so does the client.
    pub fn last_request(&self) {
        self.state.lock().last_request = true;
    }

    /// Operations without a response after this time are cancelled
    pub fn set_timeout(&self, timeout: Option<Duration>) {
        self.state.lock().timeout = timeout;
    }

    pub fn get(&self) -> Status {
        self.start_operation(Operation::Get, Outbound::None)
    }

    pub fn put(&self, value: Box<dyn PvValue>, changed: BitSet) -> Status {
        self.start_operation(Operation::Put, Outbound::Value { value, changed: Some(changed) })
    }

    pub fn get_put(&self) -> Status {
        self.start_operation(Operation::GetPut, Outbound::None)
    }

    pub fn put_get(&self, value: Box<dyn PvValue>, changed: BitSet) -> Status {
        self.start_operation(Operation::PutGet, Outbound::Value { value, changed: Some(changed) })
    }

    pub fn get_get(&self) -> Status {
        self.start_operation(Operation::GetGet, Outbound::None)
    }

    pub fn get_array(&self, offset: usize, count: usize, stride: usize) -> Status {
        self.start_operation(Operation::GetArray { offset, count, stride }, Outbound::None)
    }

    pub fn put_array(&self, value: Box<dyn PvValue>, offset: usize, stride: usize) -> Status {
        self.start_operation(Operation::PutArray { offset, stride }, Outbound::Value { value, changed: None })
    }

    pub fn get_length(&self) -> Status {
        self.start_operation(Operation::GetLength, Outbound::None)
    }

    pub fn set_length(&self, length: usize) -> Status {
        self.start_operation(Operation::SetLength { length }, Outbound::None)
    }

    pub fn process(&self) -> Status {
        self.start_operation(Operation::Process, Outbound::None)
    }

    pub fn rpc(&self, argument: Option<Box<dyn PvValue>>) -> Status {
        self.start_operation(Operation::Rpc, Outbound::Argument(argument))
    }

    /// Starts the subscription. A started monitor is restarted automatically after a reconnect,
    ///  without another completion.
    pub fn start(&self) -> Status {
        let status = self.start_operation(Operation::Start, Outbound::None);
        if status.is_success() {
            self.state.lock().monitor_started = true;
        }
        status
    }

    pub fn stop(&self) -> Status {
        let status = self.start_operation(Operation::Stop, Outbound::None);
        if status.is_success() {
            self.state.lock().monitor_started = false;
        }
        status
    }

    /// the oldest queued monitor element
    pub fn poll(&self) -> Option<MonitorElement> {
        self.state.lock().monitor.as_mut()?.poll()
    }

    /// Returns a polled monitor element to the queue
    pub fn release(&self, element: MonitorElement) {
        let Some(me) = self.me.upgrade() else {
            return;
        };
        let available = {
            let mut state = self.state.lock();
            let Some(monitor) = state.monitor.as_mut() else {
                return;
            };
            match monitor.release(element) {
                Ok(available) => available,
                Err(e) => {
                    warn!("failed to apply accumulated monitor changes: {}", e);
                    false
                }
            }
        };
        if available {
            self.requester.monitor_event(&me);
        }
    }

    fn start_operation(&self, operation: Operation, outbound: Outbound) -> Status {
        self.start_operation_with(operation, outbound, true)
    }

    #[instrument(level = "trace", skip(self, outbound), fields(ioid = self.ioid))]
    fn start_operation_with(&self, operation: Operation, outbound: Outbound, notify: bool) -> Status {
        if !self.kind.supports(operation) || operation.is_init() {
            return Status::not_supported(operation.name());
        }

        let (seq, timeout) = {
            let mut state = self.state.lock();
            if state.destroyed {
                return Status::request_destroyed();
            }
            if !state.initialized {
                return Status::not_initialized();
            }
            if state.pending.is_some() {
                return Status::other_request_pending();
            }
            state.next_seq += 1;
            let seq = state.next_seq;
            state.pending = Some(Pending { operation, seq, sent: false, outbound, notify });
            (seq, state.timeout)
        };

        let connection = self.channel.upgrade().and_then(|c| c.connection());
        let Some((transport, _)) = connection else {
            let mut state = self.state.lock();
            if state.pending.as_ref().map(|p| p.seq) == Some(seq) {
                state.pending = None;
                return Status::channel_not_connected();
            }
            // the disconnect completed the operation in the meantime
            return Status::ok();
        };

        if let Some(timeout) = timeout {
            self.schedule_timeout(seq, timeout);
        }
        if let Some(me) = self.me.upgrade() {
            transport.enqueue(me);
        }
        Status::ok()
    }

    fn schedule_timeout(&self, seq: u64, timeout: Duration) {
        let Some(context) = self.channel.upgrade().and_then(|c| c.context()) else {
            return;
        };
        let me = self.me.clone();
        context.spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(request) = me.upgrade() {
                request.on_timeout(seq);
            }
        });
    }

    fn on_timeout(&self, seq: u64) {
        self.cancel_with(Status::timed_out(), Some(seq));
    }

    /// Cancels the pending operation. It completes with a 'cancelled' status right away, and
    ///  a late response is ignored. Servers that predate cancel messages still respond, so
    ///  the next response with the cancelled operation's QoS is dropped.
    pub fn cancel(&self) {
        self.cancel_with(Status::cancelled(), None);
    }

    /// `only_seq` restricts the cancel to one specific operation, e.g. the one a timer was
    ///  started for
    fn cancel_with(&self, status: Status, only_seq: Option<u64>) {
        let Some(me) = self.me.upgrade() else {
            return;
        };
        let connection = self.channel.upgrade().and_then(|c| c.connection());
        let can_cancel = connection.as_ref().map_or(false, |(transport, _)| transport.revision() >= CANCEL_MIN_REVISION);

        let pending = {
            let mut state = self.state.lock();
            let pending = match &state.pending {
                Some(p) if !p.operation.is_init() && only_seq.map_or(true, |seq| seq == p.seq) => state.pending.take(),
                _ => None,
            };
            if let Some(p) = &pending {
                if p.sent && connection.is_some() && !can_cancel {
                    state.stale.push(p.operation.qos(self.kind));
                }
            }
            pending
        };
        if only_seq.is_some() && pending.is_some() {
            debug!("request {} timed out", self.ioid);
        }
        let Some(pending) = pending else {
            return;
        };

        if pending.sent && can_cancel {
            if let Some((transport, sid)) = connection {
                transport.enqueue(Arc::new(RequestControlSender {
                    command: Command::CancelRequest,
                    sid,
                    ioid: self.ioid,
                }));
            }
        }
        if pending.notify {
            self.requester.operation_completed(&me, pending.operation, &status, ResponseData::None);
        }
    }

    /// Destroys the request locally and on the server. A pending operation completes with a
    ///  'destroyed' status.
    pub fn destroy(&self) {
        self.destroy_internal(true);
    }

    /// the channel is being destroyed, which implicitly destroys the request on the server
    pub(crate) fn destroy_by_channel(&self) {
        self.destroy_internal(false);
    }

    fn destroy_internal(&self, notify_server: bool) {
        let Some(me) = self.me.upgrade() else {
            return;
        };
        let (pending, send_destroy) = {
            let mut state = self.state.lock();
            if state.destroyed {
                return;
            }
            state.destroyed = true;
            state.monitor_started = false;
            let pending = state.pending.take();
            let known_to_server = state.initialized || pending.as_ref().map(|p| p.sent).unwrap_or(false);
            (pending, notify_server && known_to_server && !state.remotely_destroyed)
        };
        debug!("destroying request {} ({:?})", self.ioid, self.kind);

        if let Some(channel) = self.channel.upgrade() {
            let connection = channel.unregister_request(self.ioid);
            if send_destroy {
                if let Some((transport, sid)) = connection {
                    transport.enqueue(Arc::new(RequestControlSender {
                        command: Command::DestroyRequest,
                        sid,
                        ioid: self.ioid,
                    }));
                }
            }
            if let Some(context) = channel.context() {
                context.remove_request(self.ioid);
            }
        }

        if let Some(pending) = pending {
            let status = Status::request_destroyed();
            if pending.operation.is_init() && self.kind != RequestKind::GetField {
                self.requester.request_connected(&me, &status, None);
            }
            else if pending.notify {
                self.requester.operation_completed(&me, pending.operation, &status, ResponseData::None);
            }
        }
        self.requester.request_destroyed(&me);
    }

    /// (Re)sends initialization, e.g. after the channel connected
    pub(crate) fn resubscribe(&self, transport: &Arc<Transport>) {
        let Some(me) = self.me.upgrade() else {
            return;
        };
        let displaced = {
            let mut state = self.state.lock();
            if state.destroyed {
                return;
            }
            state.initialized = false;
            state.stale.clear();
            state.next_seq += 1;
            let operation = if self.kind == RequestKind::GetField { Operation::GetField } else { Operation::Init };
            let init = Pending { operation, seq: state.next_seq, sent: false, outbound: Outbound::None, notify: true };
            state.pending.replace(init)
        };

        if let Some(displaced) = displaced.filter(|p| !p.operation.is_init() && p.notify) {
            self.requester.operation_completed(&me, displaced.operation, &Status::channel_disconnected(), ResponseData::None);
        }
        trace!("initializing request {} on {}", self.ioid, transport.remote_addr());
        transport.enqueue(me);
    }

    /// The channel lost its connection: a pending operation fails, a pending initialization is
    ///  replayed on reconnect.
    pub(crate) fn channel_disconnected(&self) {
        let Some(me) = self.me.upgrade() else {
            return;
        };
        let interrupted = {
            let mut state = self.state.lock();
            if state.destroyed {
                return;
            }
            state.stale.clear();
            state.pending.take().filter(|p| !p.operation.is_init() && p.notify)
        };
        if let Some(pending) = interrupted {
            self.requester.operation_completed(&me, pending.operation, &Status::channel_disconnected(), ResponseData::None);
        }
        self.requester.channel_disconnected(&me);
    }

    pub(crate) fn on_server_message(&self, message: &ServerMessage) {
        if let Some(me) = self.me.upgrade() {
            self.requester.server_message(&me, message);
        }
    }

    /// Handles a response addressed to this request's ioid
    pub(crate) fn on_response(&self, registry: &mut dyn FieldRegistry, command: Command, mut body: WireBuf) {
        if command == Command::DestroyRequest {
            debug!("server destroyed request {}", self.ioid);
            self.state.lock().remotely_destroyed = true;
            self.destroy_internal(false);
            return;
        }
        if command != self.kind.command() {
            debug!("{:?} response for {:?} request {} - ignoring", command, self.kind, self.ioid);
            return;
        }
        if self.kind == RequestKind::GetField {
            self.on_get_field_response(registry, body);
            return;
        }

        let qos = match body.try_get_u8() {
            Ok(qos) => Qos::from_bits_retain(qos),
            Err(e) => {
                warn!("truncated response for request {}: {}", self.ioid, e);
                self.fail_pending(Status::error(format!("malformed response: {}", e)));
                return;
            }
        };
        if qos.contains(Qos::INIT) {
            self.on_init_response(registry, body);
        }
        else if self.kind == RequestKind::Monitor {
            self.on_monitor_data(qos, body);
        }
        else {
            self.on_operation_response(registry, qos, body);
        }
    }

    /// completes a pending operation (not an initialization) with an error
    fn fail_pending(&self, status: Status) {
        let Some(me) = self.me.upgrade() else {
            return;
        };
        let failed = {
            let mut state = self.state.lock();
            match &state.pending {
                Some(p) if !p.operation.is_init() => state.pending.take(),
                _ => None,
            }
        };
        if let Some(pending) = failed.filter(|p| p.notify) {
            self.requester.operation_completed(&me, pending.operation, &status, ResponseData::None);
        }
    }

    fn on_init_response(&self, registry: &mut dyn FieldRegistry, mut body: WireBuf) {
        let Some(me) = self.me.upgrade() else {
            return;
        };
        let status = Status::deser(&mut body)
            .unwrap_or_else(|e| Status::error(format!("malformed init response: {}", e)));

        let (status, field, restart_monitor) = {
            let mut state = self.state.lock();
            if state.destroyed {
                return;
            }
            match &state.pending {
                Some(p) if p.operation == Operation::Init => {}
                _ => {
                    debug!("unexpected init response for request {} - ignoring", self.ioid);
                    return;
                }
            }
            state.pending = None;

            let status = if status.is_success() {
                match self.apply_init(&mut state, registry, &mut body) {
                    Ok(()) => {
                        state.initialized = true;
                        status
                    }
                    Err(e) => Status::error(format!("malformed init response: {}", e)),
                }
            }
            else {
                status
            };
            let restart_monitor = state.initialized && state.monitor_started;
            (status, state.field.clone(), restart_monitor)
        };

        self.requester.request_connected(&me, &status, field.as_ref());
        if restart_monitor {
            debug!("restarting monitor {}", self.ioid);
            let restarted = self.start_operation_with(Operation::Start, Outbound::None, false);
            if !restarted.is_success() {
                debug!("monitor {} was not restarted: {}", self.ioid, restarted);
            }
        }
    }

    fn apply_init(&self, state: &mut RequestState, registry: &mut dyn FieldRegistry, body: &mut WireBuf) -> anyhow::Result<()> {
        match self.kind {
            RequestKind::Get | RequestKind::Put | RequestKind::Array => {
                let field = registry.deserialize_field(body)?;
                state.value = field.clone().map(|f| f.create_value());
                state.field = field;
            }
            RequestKind::PutGet => {
                let put_field = registry.deserialize_field(body)?;
                let get_field = registry.deserialize_field(body)?;
                state.put_value = put_field.clone().map(|f| f.create_value());
                state.put_field = put_field;
                state.value = get_field.clone().map(|f| f.create_value());
                state.field = get_field;
            }
            RequestKind::Monitor => {
                let Some(field) = registry.deserialize_field(body)? else {
                    bail!("monitor without a data type");
                };
                state.monitor = Some(MonitorQueue::new(field.clone(), self.queue_size));
                state.field = Some(field);
            }
            RequestKind::Process | RequestKind::Rpc | RequestKind::GetField => {}
        }
        Ok(())
    }

    fn on_operation_response(&self, registry: &mut dyn FieldRegistry, qos: Qos, mut body: WireBuf) {
        let Some(me) = self.me.upgrade() else {
            return;
        };
        let status = Status::deser(&mut body);

        let (operation, mut value, decoded, destroy_after) = {
            let mut state = self.state.lock();
            if state.destroyed {
                return;
            }
            let response_qos = qos.difference(Qos::DESTROY);
            if let Some(idx) = state.stale.iter().position(|q| *q == response_qos) {
                state.stale.swap_remove(idx);
                debug!("late response for a cancelled operation of request {} - ignoring", self.ioid);
                return;
            }
            let Some(pending) = &state.pending else {
                debug!("response for request {} without a pending operation - ignoring", self.ioid);
                return;
            };
            let operation = pending.operation;
            if operation.is_init() || operation.qos(self.kind) != response_qos {
                debug!("response {:?} does not match pending {} of request {} - ignoring", qos, operation.name(), self.ioid);
                return;
            }
            state.pending = None;

            // the value is moved out of the state for the callback and restored afterwards
            let mut value = match operation {
                Operation::GetPut if self.kind == RequestKind::PutGet => state.put_value.take(),
                Operation::Get | Operation::GetPut | Operation::PutGet | Operation::GetGet | Operation::GetArray { .. } => state.value.take(),
                _ => None,
            };

            let decoded = match &status {
                Ok(status) if status.is_success() => decode_response(operation, registry, &mut body, value.as_mut()),
                _ => Ok(Decoded::None),
            };

            let destroy_after = qos.contains(Qos::DESTROY) || state.last_request;
            if destroy_after {
                state.remotely_destroyed = true;
            }
            (operation, value, decoded, destroy_after)
        };

        let status = match (status, &decoded) {
            (Err(e), _) => Status::error(format!("malformed response: {}", e)),
            (Ok(_), Err(e)) => Status::error(format!("malformed response: {}", e)),
            (Ok(status), Ok(_)) => status,
        };
        let data = match (&decoded, &value) {
            (Ok(Decoded::Changed(changed)), Some(value)) => ResponseData::Value { value: value.as_ref(), changed: Some(changed) },
            (Ok(Decoded::Whole), Some(value)) => ResponseData::Value { value: value.as_ref(), changed: None },
            (Ok(Decoded::RpcResult(Some(result))), _) => ResponseData::Value { value: result.as_ref(), changed: None },
            (Ok(Decoded::Length(length)), _) => ResponseData::Length(*length),
            _ => ResponseData::None,
        };
        self.requester.operation_completed(&me, operation, &status, data);

        if let Some(value) = value.take() {
            let mut state = self.state.lock();
            match operation {
                Operation::GetPut if self.kind == RequestKind::PutGet => state.put_value = Some(value),
                _ => state.value = Some(value),
            }
        }
        if destroy_after {
            self.destroy_internal(false);
        }
    }

    fn on_monitor_data(&self, qos: Qos, mut body: WireBuf) {
        let Some(me) = self.me.upgrade() else {
            return;
        };
        let (notify, destroy_after) = {
            let mut state = self.state.lock();
            if state.destroyed {
                return;
            }
            let destroy_after = qos.contains(Qos::DESTROY);
            if destroy_after {
                state.remotely_destroyed = true;
            }
            let notify = match state.monitor.as_mut() {
                Some(monitor) if !body.is_empty() => match monitor.on_data(&mut body) {
                    Ok(notify) => notify,
                    Err(e) => {
                        warn!("malformed monitor update for request {}: {}", self.ioid, e);
                        false
                    }
                },
                Some(_) => false,
                None => {
                    debug!("monitor data for uninitialized request {} - ignoring", self.ioid);
                    false
                }
            };
            (notify, destroy_after)
        };

        if notify {
            self.requester.monitor_event(&me);
        }
        if destroy_after {
            self.destroy_internal(false);
        }
    }

    fn on_get_field_response(&self, registry: &mut dyn FieldRegistry, mut body: WireBuf) {
        let Some(me) = self.me.upgrade() else {
            return;
        };
        let result = Status::deser(&mut body).and_then(|status| {
            let field = if status.is_success() { registry.deserialize_field(&mut body)? } else { None };
            Ok((status, field))
        });
        let (status, field) = match result {
            Ok(result) => result,
            Err(e) => (Status::error(format!("malformed response: {}", e)), None),
        };

        {
            let mut state = self.state.lock();
            if state.destroyed || state.pending.as_ref().map(|p| p.operation) != Some(Operation::GetField) {
                debug!("unexpected get-field response for request {} - ignoring", self.ioid);
                return;
            }
            state.pending = None;
            state.initialized = true;
            state.remotely_destroyed = true;
            state.field = field.clone();
        }

        self.requester.operation_completed(&me, Operation::GetField, &status, ResponseData::Field(field.as_ref()));
        self.destroy_internal(false);
    }

    fn write_operation(&self, buffer: &mut SendBuffer, sid: u32, pending: &Pending, last_request: bool) -> anyhow::Result<()> {
        let operation = pending.operation;
        buffer.start_message(self.kind.command(), 9 + self.pv_request.len());
        buffer.put_u32(sid);
        buffer.put_u32(self.ioid);

        if operation == Operation::GetField {
            buffer.put_string(&self.sub_field);
            buffer.end_message();
            return Ok(());
        }

        let mut qos = operation.qos(self.kind);
        if last_request && operation != Operation::Init {
            qos |= Qos::DESTROY;
        }
        buffer.put_u8(qos.bits());

        match (operation, &pending.outbound) {
            (Operation::Init, _) => buffer.put_slice(&self.pv_request),
            (Operation::Put | Operation::PutGet, Outbound::Value { value, changed: Some(changed) }) => {
                serialize_bitset(changed, buffer.payload_mut());
                value.serialize(buffer.payload_mut(), Some(changed));
            }
            (Operation::PutArray { offset, stride }, Outbound::Value { value, .. }) => {
                buffer.put_size(offset);
                buffer.put_size(stride);
                value.serialize(buffer.payload_mut(), None);
            }
            (Operation::GetArray { offset, count, stride }, _) => {
                buffer.put_size(offset);
                buffer.put_size(count);
                buffer.put_size(stride);
            }
            (Operation::SetLength { length }, _) => buffer.put_size(length),
            (Operation::Rpc, Outbound::Argument(argument)) => serialize_full(argument.as_deref(), buffer.payload_mut()),
            (Operation::Put | Operation::PutGet | Operation::PutArray { .. } | Operation::Rpc, _) => {
                bail!("{} without data", operation.name());
            }
            _ => {}
        }
        buffer.end_message();
        Ok(())
    }
}

fn decode_response(operation: Operation, registry: &mut dyn FieldRegistry, body: &mut WireBuf, value: Option<&mut Box<dyn PvValue>>) -> anyhow::Result<Decoded> {
    match operation {
        Operation::Get | Operation::GetPut | Operation::PutGet | Operation::GetGet => {
            let Some(value) = value else {
                bail!("response data without a data type");
            };
            let changed = deserialize_bitset(body)?;
            value.deserialize(body, Some(&changed))?;
            Ok(Decoded::Changed(changed))
        }
        Operation::GetArray { .. } => {
            let Some(value) = value else {
                bail!("array data without a data type");
            };
            value.deserialize(body, None)?;
            Ok(Decoded::Whole)
        }
        Operation::GetLength => {
            let length = body.try_get_size()?.unwrap_or(0);
            Ok(Decoded::Length(length))
        }
        Operation::Rpc => {
            let result = match registry.deserialize_field(body)? {
                Some(field) => {
                    let mut result = field.create_value();
                    result.deserialize(body, None)?;
                    Some(result)
                }
                None => None,
            };
            Ok(Decoded::RpcResult(result))
        }
        _ => Ok(Decoded::None),
    }
}

impl TransportSender for Request {
    fn send(&self, buffer: &mut SendBuffer, _transport: &Transport) -> anyhow::Result<()> {
        let Some(sid) = self.channel.upgrade().and_then(|c| c.server_id()) else {
            trace!("request {} has no server side channel - not sending", self.ioid);
            return Ok(());
        };
        let Some(me) = self.me.upgrade() else {
            return Ok(());
        };

        let (completed, failed) = {
            let mut state = self.state.lock();
            let last_request = state.last_request;
            let Some(pending) = state.pending.as_mut() else {
                return Ok(());
            };
            if pending.sent {
                return Ok(());
            }
            pending.sent = true;
            let operation = pending.operation;
            let notify = pending.notify;

            match self.write_operation(buffer, sid, pending, last_request) {
                Ok(()) if operation.completes_when_sent() => {
                    state.pending = None;
                    (Some(operation).filter(|_| notify), None)
                }
                Ok(()) => (None, None),
                Err(e) => {
                    state.pending = None;
                    (None, Some((operation, notify, e)))
                }
            }
        };

        if let Some(operation) = completed {
            self.requester.operation_completed(&me, operation, &Status::ok(), ResponseData::None);
        }
        if let Some((operation, notify, e)) = failed {
            if notify {
                self.requester.operation_completed(&me, operation, &Status::error(e.to_string()), ResponseData::None);
            }
            return Err(e);
        }
        Ok(())
    }
}

/// A request-level message without body beyond the ids: destroy and cancel
pub struct RequestControlSender {
    pub command: Command,
    pub sid: u32,
    pub ioid: u32,
}

impl TransportSender for RequestControlSender {
    fn send(&self, buffer: &mut SendBuffer, _transport: &Transport) -> anyhow::Result<()> {
        buffer.start_message(self.command, 8);
        buffer.put_u32(self.sid);
        buffer.put_u32(self.ioid);
        buffer.end_message();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::channel::Channel;
    use crate::protocol::header::ByteOrder;
    use crate::protocol::messages::MessageSeverity;
    use crate::test_util::client::{init_response, monitor_update, status_response, value_response, RecordedData, RecordingRequester, RequestEvent, TestClient};
    use crate::test_util::codec::{sample_value, TreeDesc};
    use bytes::BytesMut;
    use rstest::rstest;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn bits(b: &[usize]) -> BitSet {
        b.iter().copied().collect()
    }

    fn desc() -> TreeDesc {
        TreeDesc::flat(3)
    }

    fn wire(payload: Bytes) -> WireBuf {
        WireBuf::new(payload, ByteOrder::BigEndian)
    }

    fn complete_init(client: &TestClient, request: &Request) {
        let desc = desc();
        let fields: Vec<Option<&dyn FieldDesc>> = match request.kind() {
            RequestKind::PutGet => vec![Some(&desc as &dyn FieldDesc), Some(&desc as &dyn FieldDesc)],
            RequestKind::Process | RequestKind::Rpc => vec![],
            _ => vec![Some(&desc as &dyn FieldDesc)],
        };
        client.deliver(request.kind().command(), init_response(request.ioid(), &Status::ok(), &fields));
    }

    async fn connected_request(client: &TestClient, kind: RequestKind) -> (Arc<Channel>, Arc<Request>, Arc<RecordingRequester>) {
        let (channel, _) = client.connected_channel("test").await;
        let requester = Arc::new(RecordingRequester::default());
        let request = channel.create_request(kind, requester.clone(), None).unwrap();

        let sent = client.take_requests();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].qos, Some(Qos::INIT));
        assert_eq!(sent[0].sid, channel.cid() + TestClient::SID_OFFSET);
        assert_eq!(sent[0].ioid, request.ioid());

        complete_init(client, &request);
        assert_eq!(requester.take_events(), vec![RequestEvent::Connected(Status::ok())]);
        assert!(request.is_initialized());
        (channel, request, requester)
    }

    fn start_any(request: &Request) -> Status {
        match request.kind() {
            RequestKind::Get => request.get(),
            RequestKind::Put => request.put(sample_value(desc()), bits(&[1])),
            RequestKind::PutGet => request.put_get(sample_value(desc()), bits(&[1])),
            RequestKind::Array => request.get_array(0, 2, 1),
            RequestKind::Process => request.process(),
            RequestKind::Rpc => request.rpc(None),
            RequestKind::Monitor => request.start(),
            RequestKind::GetField => Status::not_supported("getField"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_get() {
        let client = TestClient::new();
        let (_, request, requester) = connected_request(&client, RequestKind::Get).await;

        assert!(request.get().is_ok());
        let sent = client.take_requests();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].is(Command::Get));
        assert_eq!(sent[0].qos, Some(Qos::empty()));

        let value = sample_value(desc());
        client.deliver(Command::Get, value_response(request.ioid(), Qos::empty(), value.as_ref(), &bits(&[1, 3])));
        assert_eq!(requester.take_events(), vec![
            RequestEvent::Completed(Operation::Get, Status::ok(), RecordedData::Value { values: vec![0, 10, 0, 30], changed: Some(bits(&[1, 3])) }),
        ]);

        // the value is kept between operations
        assert!(request.get().is_ok());
        client.take_requests();
        client.deliver(Command::Get, value_response(request.ioid(), Qos::empty(), value.as_ref(), &bits(&[2])));
        assert_eq!(requester.take_events(), vec![
            RequestEvent::Completed(Operation::Get, Status::ok(), RecordedData::Value { values: vec![0, 10, 20, 30], changed: Some(bits(&[2])) }),
        ]);
    }

    #[rstest]
    #[case::get(RequestKind::Get)]
    #[case::put(RequestKind::Put)]
    #[case::put_get(RequestKind::PutGet)]
    #[case::array(RequestKind::Array)]
    #[case::process(RequestKind::Process)]
    #[case::rpc(RequestKind::Rpc)]
    #[case::monitor(RequestKind::Monitor)]
    #[tokio::test(start_paused = true)]
    async fn test_at_most_one_pending(#[case] kind: RequestKind) {
        let client = TestClient::new();
        let (_, request, _) = connected_request(&client, kind).await;

        assert!(start_any(&request).is_ok());
        assert_eq!(start_any(&request), Status::other_request_pending());
        assert_eq!(client.take_requests().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsupported_operations() {
        let client = TestClient::new();
        let (_, request, requester) = connected_request(&client, RequestKind::Get).await;

        assert_eq!(request.put(sample_value(desc()), bits(&[1])), Status::not_supported("put"));
        assert_eq!(request.start(), Status::not_supported("start"));
        assert_eq!(request.get_length(), Status::not_supported("getLength"));
        assert!(client.take_requests().is_empty());
        assert!(requester.events().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_operations_require_initialization() {
        let client = TestClient::new();
        let (channel, _) = client.found_channel("unconnected").await;
        client.connector.take_outbound(TestClient::SERVER);

        let request = channel.create_get(Arc::new(RecordingRequester::default()), None).unwrap();
        assert!(client.take_requests().is_empty());
        assert_eq!(request.get(), Status::not_initialized());
        assert_eq!(channel.request_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_requests_replayed_in_order_after_reconnect() {
        let client = TestClient::new();
        let (channel, _) = client.found_channel("replay").await;
        client.connector.take_outbound(TestClient::SERVER);

        let requester = Arc::new(RecordingRequester::default());
        let requests = [RequestKind::Get, RequestKind::Put, RequestKind::Monitor]
            .map(|kind| channel.create_request(kind, requester.clone(), None).unwrap());
        let ioids = requests.iter().map(|r| r.ioid()).collect::<Vec<_>>();
        assert!(client.take_requests().is_empty());

        client.create_channel(&channel, Status::ok());
        let sent = client.take_requests();
        assert_eq!(sent.iter().map(|s| s.ioid).collect::<Vec<_>>(), ioids);
        assert!(sent.iter().all(|s| s.qos == Some(Qos::INIT)));

        for request in &requests {
            complete_init(&client, request);
        }
        assert!(requests[2].start().is_ok());
        client.take_requests();
        requester.take_events();

        client.connector.transport(TestClient::SERVER).unwrap().close();
        assert_eq!(requester.take_events(), vec![RequestEvent::Disconnected; 3]);

        assert!(client.context.search().search_response(channel.cid(), 0, TestClient::SERVER));
        TestClient::settle().await;
        client.connector.take_outbound(TestClient::SERVER);
        client.create_channel(&channel, Status::ok());

        let sent = client.take_requests();
        assert_eq!(sent.iter().map(|s| s.ioid).collect::<Vec<_>>(), ioids);
        assert!(sent.iter().all(|s| s.qos == Some(Qos::INIT)));
        // new operations wait for the replayed initialization
        assert_eq!(requests[0].get(), Status::not_initialized());

        for request in &requests {
            complete_init(&client, request);
        }
        let sent = client.take_requests();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].ioid, requests[2].ioid());
        assert_eq!(sent[0].qos, Some(Qos::PROCESS | Qos::GET));
        // the restart is not an operation of the application
        assert!(requester.completions().is_empty());
        assert_eq!(requester.take_events(), vec![RequestEvent::Connected(Status::ok()); 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_element_from_before_reconnect() {
        let client = TestClient::new();
        let (channel, _) = client.connected_channel("elements").await;
        let requester = Arc::new(RecordingRequester::default());
        let request = channel.create_monitor(requester.clone(), None, Some(2)).unwrap();
        client.take_requests();
        complete_init(&client, &request);
        assert!(request.start().is_ok());
        client.take_requests();

        let value = sample_value(desc());
        client.deliver(Command::Monitor, monitor_update(request.ioid(), value.as_ref(), &bits(&[1]), &BitSet::new()));
        let old_element = request.poll().unwrap();

        client.connector.transport(TestClient::SERVER).unwrap().close();
        assert!(client.context.search().search_response(channel.cid(), 0, TestClient::SERVER));
        TestClient::settle().await;
        client.connector.take_outbound(TestClient::SERVER);
        client.create_channel(&channel, Status::ok());
        client.take_requests();
        complete_init(&client, &request);
        assert_eq!(client.take_requests()[0].qos, Some(Qos::PROCESS | Qos::GET));
        requester.take_events();

        for field in [1, 2] {
            client.deliver(Command::Monitor, monitor_update(request.ioid(), value.as_ref(), &bits(&[field]), &BitSet::new()));
        }
        assert_eq!(requester.take_events(), vec![RequestEvent::Monitor; 2]);

        // the new queue does not take the element, so it keeps exactly two
        request.release(old_element);
        assert!(requester.events().is_empty());
        let first = request.poll().unwrap();
        let second = request.poll().unwrap();
        assert!(request.poll().is_none());
        assert_eq!(first.changed, bits(&[1]));
        assert_eq!(second.changed, bits(&[2]));
        request.release(first);
        request.release(second);

        for field in [1, 2, 3] {
            client.deliver(Command::Monitor, monitor_update(request.ioid(), value.as_ref(), &bits(&[field]), &BitSet::new()));
        }
        assert_eq!(requester.take_events(), vec![RequestEvent::Monitor; 2]);
        assert_eq!(request.poll().unwrap().changed, bits(&[1]));
        assert_eq!(request.poll().unwrap().changed, bits(&[2, 3]));
        assert!(request.poll().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_fails_pending_operation() {
        let client = TestClient::new();
        let (_, request, requester) = connected_request(&client, RequestKind::Get).await;
        assert!(request.get().is_ok());
        client.take_requests();

        let transport = client.connector.transport(TestClient::SERVER).unwrap();
        transport.unresponsive();
        assert_eq!(requester.take_events(), vec![
            RequestEvent::Completed(Operation::Get, Status::channel_disconnected(), RecordedData::None),
            RequestEvent::Disconnected,
        ]);
        assert_eq!(request.get(), Status::channel_not_connected());

        transport.alive_notification();
        let sent = client.take_requests();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].qos, Some(Qos::INIT));

        // a late response to the failed get is not mistaken for the init response
        let value = sample_value(desc());
        client.deliver(Command::Get, value_response(request.ioid(), Qos::empty(), value.as_ref(), &bits(&[1])));
        assert!(requester.events().is_empty());
        assert_eq!(request.pending_operation(), Some(Operation::Init));
    }

    #[rstest]
    #[case::supported(2, true)]
    #[case::old_server(1, false)]
    #[tokio::test(start_paused = true)]
    async fn test_cancel(#[case] revision: u8, #[case] expect_cancel_message: bool) {
        let client = TestClient::new();
        let (_, request, requester) = connected_request(&client, RequestKind::Get).await;
        client.connector.transport(TestClient::SERVER).unwrap().on_peer_revision(revision);

        assert!(request.get().is_ok());
        client.take_requests();
        request.cancel();
        assert_eq!(requester.take_events(), vec![RequestEvent::Completed(Operation::Get, Status::cancelled(), RecordedData::None)]);

        let sent = client.take_requests();
        if expect_cancel_message {
            assert_eq!(sent.len(), 1);
            assert!(sent[0].is(Command::CancelRequest));
            assert_eq!(sent[0].ioid, request.ioid());
        }
        else {
            assert!(sent.is_empty());
        }

        let value = sample_value(desc());
        client.deliver(Command::Get, value_response(request.ioid(), Qos::empty(), value.as_ref(), &bits(&[1])));
        assert!(requester.events().is_empty());
        assert!(request.get().is_ok());
    }

    #[rstest]
    #[case::supported(2)]
    #[case::old_server(1)]
    #[tokio::test(start_paused = true)]
    async fn test_response_after_cancel_does_not_complete_next_operation(#[case] revision: u8) {
        let client = TestClient::new();
        let (_, request, requester) = connected_request(&client, RequestKind::Get).await;
        client.connector.transport(TestClient::SERVER).unwrap().on_peer_revision(revision);

        assert!(request.get().is_ok());
        client.take_requests();
        request.cancel();
        requester.take_events();
        assert!(request.get().is_ok());
        client.take_requests();

        let value = sample_value(desc());
        if revision < CANCEL_MIN_REVISION {
            // an old server answers the cancelled get anyway
            client.deliver(Command::Get, value_response(request.ioid(), Qos::empty(), value.as_ref(), &bits(&[1])));
            assert!(requester.events().is_empty());
            assert_eq!(request.pending_operation(), Some(Operation::Get));
        }

        client.deliver(Command::Get, value_response(request.ioid(), Qos::empty(), value.as_ref(), &bits(&[2])));
        assert_eq!(requester.completions(), vec![(Operation::Get, Status::ok())]);
        assert_eq!(request.pending_operation(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout() {
        let client = TestClient::new();
        let (_, request, requester) = connected_request(&client, RequestKind::Get).await;
        request.set_timeout(Some(Duration::from_secs(1)));

        // answered in time
        assert!(request.get().is_ok());
        client.take_requests();
        let value = sample_value(desc());
        client.deliver(Command::Get, value_response(request.ioid(), Qos::empty(), value.as_ref(), &bits(&[1])));
        assert_eq!(requester.take_events().len(), 1);

        assert!(request.get().is_ok());
        client.take_requests();
        tokio::time::sleep(Duration::from_secs(1)).await;
        TestClient::settle().await;
        assert_eq!(requester.take_events(), vec![RequestEvent::Completed(Operation::Get, Status::timed_out(), RecordedData::None)]);
        assert!(client.take_requests()[0].is(Command::CancelRequest));
    }

    #[tokio::test(start_paused = true)]
    async fn test_last_request() {
        let client = TestClient::new();
        let (channel, request, requester) = connected_request(&client, RequestKind::Get).await;
        request.last_request();

        assert!(request.get().is_ok());
        let sent = client.take_requests();
        assert_eq!(sent[0].qos, Some(Qos::DESTROY));

        let value = sample_value(desc());
        client.deliver(Command::Get, value_response(request.ioid(), Qos::DESTROY, value.as_ref(), &bits(&[0])));
        assert_eq!(requester.take_events(), vec![
            RequestEvent::Completed(Operation::Get, Status::ok(), RecordedData::Value { values: vec![0, 10, 20, 30], changed: Some(bits(&[0])) }),
            RequestEvent::Destroyed,
        ]);
        assert!(request.is_destroyed());
        assert!(client.take_requests().is_empty());
        assert_eq!(channel.request_count(), 0);
        assert_eq!(client.context.request_count(), 0);
        assert_eq!(request.get(), Status::request_destroyed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_destroy_completes_pending_operation() {
        let client = TestClient::new();
        let (channel, request, requester) = connected_request(&client, RequestKind::Get).await;
        assert!(request.get().is_ok());
        client.take_requests();

        request.destroy();
        request.destroy();
        assert_eq!(requester.take_events(), vec![
            RequestEvent::Completed(Operation::Get, Status::request_destroyed(), RecordedData::None),
            RequestEvent::Destroyed,
        ]);
        let sent = client.take_requests();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].is(Command::DestroyRequest));
        assert_eq!(sent[0].sid, channel.cid() + TestClient::SID_OFFSET);
        assert_eq!(sent[0].ioid, request.ioid());
        assert_eq!(channel.request_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_channel_destroy_destroys_requests() {
        let client = TestClient::new();
        let (channel, request, requester) = connected_request(&client, RequestKind::Get).await;
        channel.destroy(true);
        assert_eq!(requester.take_events(), vec![RequestEvent::Destroyed]);
        assert!(request.is_destroyed());
        assert_eq!(client.context.request_count(), 0);

        let commands = client.take_requests().iter().map(|s| s.command).collect::<Vec<_>>();
        assert_eq!(commands, vec![u8::from(Command::DestroyChannel)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_put() {
        let client = TestClient::new();
        let (_, request, requester) = connected_request(&client, RequestKind::Put).await;

        assert!(request.put(sample_value(desc()), bits(&[2])).is_ok());
        let sent = client.take_requests();
        assert_eq!(sent[0].qos, Some(Qos::empty()));
        let mut body = wire(sent[0].body.clone());
        assert_eq!(deserialize_bitset(&mut body).unwrap(), bits(&[2]));
        assert_eq!(body.try_get_i32().unwrap(), 20);
        assert!(body.is_empty());

        client.deliver(Command::Put, status_response(request.ioid(), Qos::empty(), &Status::ok()));
        assert_eq!(requester.take_events(), vec![RequestEvent::Completed(Operation::Put, Status::ok(), RecordedData::None)]);

        assert!(request.get_put().is_ok());
        assert_eq!(client.take_requests()[0].qos, Some(Qos::GET));
        let value = sample_value(desc());
        client.deliver(Command::Put, value_response(request.ioid(), Qos::GET, value.as_ref(), &bits(&[0])));
        assert_eq!(requester.take_events(), vec![
            RequestEvent::Completed(Operation::GetPut, Status::ok(), RecordedData::Value { values: vec![0, 10, 20, 30], changed: Some(bits(&[0])) }),
        ]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_put_get_selectors() {
        let client = TestClient::new();
        let (_, request, requester) = connected_request(&client, RequestKind::PutGet).await;
        let value = sample_value(desc());

        assert!(request.get_get().is_ok());
        assert_eq!(client.take_requests()[0].qos, Some(Qos::GET));
        // a response for a different sub-operation is ignored
        client.deliver(Command::PutGet, value_response(request.ioid(), Qos::GET_PUT, value.as_ref(), &bits(&[1])));
        assert!(requester.events().is_empty());
        client.deliver(Command::PutGet, value_response(request.ioid(), Qos::GET, value.as_ref(), &bits(&[1])));
        assert_eq!(requester.completions(), vec![(Operation::GetGet, Status::ok())]);

        assert!(request.get_put().is_ok());
        assert_eq!(client.take_requests()[0].qos, Some(Qos::GET_PUT));
        client.deliver(Command::PutGet, value_response(request.ioid(), Qos::GET_PUT, value.as_ref(), &bits(&[3])));

        assert!(request.put_get(sample_value(desc()), bits(&[1])).is_ok());
        assert_eq!(client.take_requests()[0].qos, Some(Qos::empty()));
        client.deliver(Command::PutGet, value_response(request.ioid(), Qos::empty(), value.as_ref(), &bits(&[2])));

        let events = requester.take_events();
        assert_eq!(events[1], RequestEvent::Completed(Operation::GetPut, Status::ok(), RecordedData::Value { values: vec![0, 0, 0, 30], changed: Some(bits(&[3])) }));
        // put-get results land in the get structure, which already holds field 1 from get-get
        assert_eq!(events[2], RequestEvent::Completed(Operation::PutGet, Status::ok(), RecordedData::Value { values: vec![0, 10, 20, 0], changed: Some(bits(&[2])) }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_array_operations() {
        let client = TestClient::new();
        let (_, request, requester) = connected_request(&client, RequestKind::Array).await;

        assert!(request.get_length().is_ok());
        assert_eq!(client.take_requests()[0].qos, Some(Qos::PROCESS));
        let mut buf = BytesMut::new();
        buf.put_u32(request.ioid());
        buf.put_u8(Qos::PROCESS.bits());
        Status::ok().ser(&mut buf);
        buf.put_size(5);
        client.deliver(Command::Array, buf.freeze());
        assert_eq!(requester.take_events(), vec![RequestEvent::Completed(Operation::GetLength, Status::ok(), RecordedData::Length(5))]);

        assert!(request.set_length(7).is_ok());
        let sent = client.take_requests();
        assert_eq!(sent[0].qos, Some(Qos::GET_PUT));
        assert_eq!(sent[0].body.as_ref(), &[7u8]);
        client.deliver(Command::Array, status_response(request.ioid(), Qos::GET_PUT, &Status::ok()));

        assert!(request.get_array(1, 2, 1).is_ok());
        let sent = client.take_requests();
        assert_eq!(sent[0].qos, Some(Qos::GET));
        assert_eq!(sent[0].body.as_ref(), &[1u8, 2, 1]);
        let mut buf = BytesMut::new();
        buf.put_u32(request.ioid());
        buf.put_u8(Qos::GET.bits());
        Status::ok().ser(&mut buf);
        sample_value(desc()).serialize(&mut buf, None);
        client.deliver(Command::Array, buf.freeze());

        let events = requester.take_events();
        assert_eq!(events[1], RequestEvent::Completed(Operation::GetArray { offset: 1, count: 2, stride: 1 }, Status::ok(), RecordedData::Value { values: vec![0, 10, 20, 30], changed: None }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rpc() {
        let client = TestClient::new();
        let (_, request, requester) = connected_request(&client, RequestKind::Rpc).await;

        assert!(request.rpc(Some(sample_value(desc()))).is_ok());
        let sent = client.take_requests();
        let mut expected = BytesMut::new();
        serialize_full(Some(sample_value(desc()).as_ref()), &mut expected);
        assert_eq!(sent[0].body, expected.freeze());

        let mut buf = BytesMut::new();
        buf.put_u32(request.ioid());
        buf.put_u8(0);
        Status::ok().ser(&mut buf);
        serialize_full(Some(sample_value(TreeDesc::flat(1)).as_ref()), &mut buf);
        client.deliver(Command::Rpc, buf.freeze());
        assert_eq!(requester.take_events(), vec![
            RequestEvent::Completed(Operation::Rpc, Status::ok(), RecordedData::Value { values: vec![0, 10], changed: None }),
        ]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_status_and_malformed_response() {
        let client = TestClient::new();
        let (_, request, requester) = connected_request(&client, RequestKind::Get).await;

        assert!(request.get().is_ok());
        client.take_requests();
        client.deliver(Command::Get, status_response(request.ioid(), Qos::empty(), &Status::error("no access")));
        assert_eq!(requester.take_events(), vec![RequestEvent::Completed(Operation::Get, Status::error("no access"), RecordedData::None)]);

        assert!(request.get().is_ok());
        client.take_requests();
        let mut buf = BytesMut::new();
        buf.put_u32(request.ioid());
        buf.put_u8(0);
        Status::ok().ser(&mut buf);
        serialize_bitset(&bits(&[1]), &mut buf);
        client.deliver(Command::Get, buf.freeze());
        let completions = requester.completions();
        assert_eq!(completions.len(), 1);
        assert!(!completions[0].1.is_success());
        assert!(request.get().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_response_without_qos_fails_pending_operation() {
        let client = TestClient::new();
        let (_, request, requester) = connected_request(&client, RequestKind::Get).await;

        assert!(request.get().is_ok());
        client.take_requests();
        let mut buf = BytesMut::new();
        buf.put_u32(request.ioid());
        client.deliver(Command::Get, buf.freeze());

        let completions = requester.take_events();
        assert_eq!(completions.len(), 1);
        match &completions[0] {
            RequestEvent::Completed(Operation::Get, status, RecordedData::None) => {
                assert!(!status.is_success());
                assert!(status.message.starts_with("malformed response"));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(request.pending_operation(), None);
        assert!(request.get().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor() {
        let client = TestClient::new();
        let (_, request, requester) = connected_request(&client, RequestKind::Monitor).await;

        assert!(request.start().is_ok());
        let sent = client.take_requests();
        assert_eq!(sent[0].qos, Some(Qos::PROCESS | Qos::GET));
        assert_eq!(requester.take_events(), vec![RequestEvent::Completed(Operation::Start, Status::ok(), RecordedData::None)]);

        let value = sample_value(desc());
        client.deliver(Command::Monitor, monitor_update(request.ioid(), value.as_ref(), &bits(&[1]), &BitSet::new()));
        assert_eq!(requester.take_events(), vec![RequestEvent::Monitor]);

        let element = request.poll().unwrap();
        assert_eq!(element.changed, bits(&[1]));
        assert!(request.poll().is_none());
        request.release(element);

        assert!(request.stop().is_ok());
        assert_eq!(client.take_requests()[0].qos, Some(Qos::PROCESS));
        assert_eq!(requester.completions(), vec![(Operation::Stop, Status::ok())]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_field() {
        let client = TestClient::new();
        let (channel, _) = client.connected_channel("introspected").await;
        let requester = Arc::new(RecordingRequester::default());
        let request = channel.get_field(requester.clone(), "value").unwrap();

        let sent = client.take_requests();
        assert!(sent[0].is(Command::GetField));
        assert_eq!(sent[0].qos, None);
        assert_eq!(sent[0].body.as_ref(), b"\x05value");

        let mut buf = BytesMut::new();
        buf.put_u32(request.ioid());
        Status::ok().ser(&mut buf);
        desc().serialize(&mut buf);
        client.deliver(Command::GetField, buf.freeze());
        assert_eq!(requester.take_events(), vec![
            RequestEvent::Completed(Operation::GetField, Status::ok(), RecordedData::Field(true)),
            RequestEvent::Destroyed,
        ]);
        assert!(client.take_requests().is_empty());
        assert_eq!(channel.request_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_completion_callback_starts_next_operation() {
        let client = TestClient::new();
        let (_, request, requester) = connected_request(&client, RequestKind::Get).await;
        let restarted = Arc::new(AtomicUsize::new(0));
        let counter = restarted.clone();
        requester.on_completed(move |request, _| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                assert!(request.get().is_ok());
            }
        });

        assert!(request.get().is_ok());
        client.take_requests();
        let value = sample_value(desc());
        client.deliver(Command::Get, value_response(request.ioid(), Qos::empty(), value.as_ref(), &bits(&[1])));

        assert_eq!(restarted.load(Ordering::SeqCst), 1);
        assert_eq!(request.pending_operation(), Some(Operation::Get));
        assert_eq!(client.take_requests().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_message_and_server_side_destroy() {
        let client = TestClient::new();
        let (channel, request, requester) = connected_request(&client, RequestKind::Get).await;

        let mut buf = BytesMut::new();
        ServerMessage { ioid: request.ioid(), severity: MessageSeverity::Warning, text: "limited".to_string() }.ser(&mut buf);
        client.deliver(Command::Message, buf.freeze());
        assert_eq!(requester.take_events(), vec![RequestEvent::Message("limited".to_string())]);

        let mut buf = BytesMut::new();
        buf.put_u32(channel.cid() + TestClient::SID_OFFSET);
        buf.put_u32(request.ioid());
        client.deliver(Command::DestroyRequest, buf.freeze());
        assert_eq!(requester.take_events(), vec![RequestEvent::Destroyed]);
        assert!(client.take_requests().is_empty());
    }
}
