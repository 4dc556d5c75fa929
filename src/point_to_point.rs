//! Point to point communication
//!
//! An in-process active-message transport between the local endpoints of a `Universe`.  It is the
//! native counterpart of generalized requests: every operation returns a request handle, and the
//! transport completes that request through the completion core when the message is matched.
//!
//! Each endpoint owns a mailbox with a queue of posted receives and a queue of unexpected
//! messages.  Mailboxes are grouped into channels; a channel lock guards the mailboxes of its
//! endpoints.  With `LockingMode::Global` there is a single channel, with
//! `LockingMode::PerChannel` endpoints are spread over several channels so traffic to different
//! endpoints does not contend.
//!
//! Messages are matched in order: a receive takes the first unexpected message whose envelope
//! matches, an incoming message satisfies the first matching posted receive.
//!
//! # Unfinished features
//!
//! - Ready mode sends
//! - Inspecting a pending message before receiving it

use std::collections::{BTreeMap, VecDeque};

use log::trace;
use parking_lot::{Mutex, MutexGuard};

use crate::environment::{InitOptions, Universe};
use crate::error::{Error, ErrorClass, Result};
use crate::handle::RawRequest;
use crate::request::object::{Payload, RequestKind, RequestObject};
use crate::runtime::{Registry, Runtime};

/// Identifies a local endpoint.
pub type Rank = usize;

/// Tags messages so receives can pick them out.
pub type Tag = i32;

/// Describes the outcome of a completed operation.
///
/// Native operations fill it in when they complete; generalized requests fill it in through their
/// `query` callback.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Status {
    source: Option<Rank>,
    tag: Option<Tag>,
    count: usize,
    cancelled: bool,
    error: Option<ErrorClass>,
}

impl Status {
    /// The status of an inactive request: no source, no tag, nothing transferred.
    pub fn empty() -> Self {
        Self::default()
    }

    /// The endpoint that sent the message
    pub fn source_rank(&self) -> Option<Rank> {
        self.source
    }

    /// Set the sending endpoint
    pub fn set_source_rank(&mut self, source: Option<Rank>) {
        self.source = source;
    }

    /// The message tag
    pub fn tag(&self) -> Option<Tag> {
        self.tag
    }

    /// Set the message tag
    pub fn set_tag(&mut self, tag: Option<Tag>) {
        self.tag = tag;
    }

    /// Number of bytes transferred
    pub fn count(&self) -> usize {
        self.count
    }

    /// Set the number of bytes transferred
    pub fn set_count(&mut self, count: usize) {
        self.count = count;
    }

    /// Whether the operation was cancelled
    ///
    /// # Standard section(s)
    ///
    /// 3.8.4
    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    /// Mark the operation as cancelled, or not
    pub fn set_cancelled(&mut self, cancelled: bool) {
        self.cancelled = cancelled;
    }

    /// Error the operation finished with, if any
    pub fn error(&self) -> Option<ErrorClass> {
        self.error
    }

    /// Set the error the operation finished with.  A status carrying an error makes the
    /// retiring wait fail with `Error::Status`.
    pub fn set_error(&mut self, error: Option<ErrorClass>) {
        self.error = error;
    }
}

/// Separates point to point traffic from traffic issued on behalf of collectives.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Context {
    PointToPoint,
    Collective,
}

#[derive(Debug)]
struct Message {
    source: Rank,
    tag: Tag,
    context: Context,
    data: Vec<u8>,
    /// synchronous send waiting for the message to be matched
    sender: Option<RawRequest>,
}

#[derive(Debug)]
struct PostedReceive {
    request: RawRequest,
    source: Option<Rank>,
    tag: Option<Tag>,
    context: Context,
}

impl PostedReceive {
    fn matches(&self, message: &Message) -> bool {
        self.context == message.context
            && self.source.map_or(true, |source| source == message.source)
            && self.tag.map_or(true, |tag| tag == message.tag)
    }
}

#[derive(Debug, Default)]
struct Mailbox {
    posted: VecDeque<PostedReceive>,
    unexpected: VecDeque<Message>,
}

#[derive(Debug, Default)]
struct Channel {
    mailboxes: BTreeMap<Rank, Mailbox>,
}

impl Channel {
    fn mailbox(&mut self, rank: Rank) -> &mut Mailbox {
        self.mailboxes.entry(rank).or_default()
    }
}

/// The transport state of a runtime.
#[derive(Debug)]
pub(crate) struct Transport {
    endpoints: usize,
    channels: Vec<Mutex<Channel>>,
    pub barrier: crate::collective::Barrier,
}

impl Transport {
    pub fn new(options: &InitOptions) -> Self {
        Self {
            endpoints: options.endpoint_count(),
            channels: (0..options.channel_count())
                .map(|_| Mutex::new(Channel::default()))
                .collect(),
            barrier: Default::default(),
        }
    }

    /// Number of endpoints served
    pub fn endpoints(&self) -> usize {
        self.endpoints
    }

    /// Rejects ranks outside of the universe.
    pub fn check_rank(&self, rank: Rank) -> Result<()> {
        if rank < self.endpoints {
            Ok(())
        } else {
            Err(Error::InvalidArgument("rank out of range"))
        }
    }

    /// Takes the lock of the channel serving `rank`.
    fn channel(&self, rank: Rank) -> MutexGuard<'_, Channel> {
        self.channels[rank % self.channels.len()].lock()
    }
}

/// Hands `message` to the receive request `request` and completes it.
fn deliver(registry: &mut Registry, request: RawRequest, message: Message) -> Result<()> {
    let object = registry.lookup_object_mut(request)?;
    object.status.set_source_rank(Some(message.source));
    object.status.set_tag(Some(message.tag));
    object.status.set_count(message.data.len());
    if let Payload::Receive { ref mut data, .. } = object.payload {
        *data = Some(message.data);
    }
    registry.mark_complete(request, 1)?;
    // the posted-receive reference
    registry.release_ref(request);

    if let Some(sender) = message.sender {
        registry.mark_complete(sender, 1)?;
        registry.release_ref(sender);
    }
    Ok(())
}

/// Either satisfies a posted receive with `message` or queues it as unexpected.
fn route(registry: &mut Registry, mailbox: &mut Mailbox, message: Message) -> Result<()> {
    let index = mailbox.posted.iter().position(|posted| posted.matches(&message));
    match index.and_then(|index| mailbox.posted.remove(index)) {
        Some(posted) => {
            trace!("message from {} matched receive {:#x}", message.source, posted.request);
            deliver(registry, posted.request, message)
        }
        None => {
            mailbox.unexpected.push_back(message);
            Ok(())
        }
    }
}

impl Runtime {
    fn send(
        &self,
        source: Rank,
        dest: Rank,
        tag: Tag,
        context: Context,
        data: Vec<u8>,
        synchronous: bool,
    ) -> Result<RawRequest> {
        self.transport.check_rank(source)?;
        self.transport.check_rank(dest)?;

        let mut channel = self.transport.channel(dest);
        let mut registry = self.enter();
        let request = registry.insert(RequestObject::new(
            RequestKind::Send,
            1,
            Payload::Send { dest },
        ))?;
        trace!("send {:#x}: {} -> {} tag {} ({} bytes)", request, source, dest, tag, data.len());

        let count = data.len();
        let sender = if synchronous {
            registry.add_ref(request)?;
            Some(request)
        } else {
            None
        };
        route(
            &mut registry,
            channel.mailbox(dest),
            Message {
                source,
                tag,
                context,
                data,
                sender,
            },
        )?;

        {
            let object = registry.lookup_object_mut(request)?;
            object.status.set_source_rank(Some(source));
            object.status.set_tag(Some(tag));
            object.status.set_count(count);
        }
        if !synchronous {
            // eager: the message is buffered, the send buffer is free again
            registry.mark_complete(request, 1)?;
        }
        drop(registry);
        drop(channel);
        self.notify_completion();
        Ok(request)
    }

    fn receive(
        &self,
        dest: Rank,
        source: Option<Rank>,
        tag: Option<Tag>,
        context: Context,
    ) -> Result<RawRequest> {
        self.transport.check_rank(dest)?;
        if let Some(source) = source {
            self.transport.check_rank(source)?;
        }

        let mut channel = self.transport.channel(dest);
        let mut registry = self.enter();
        let request = registry.insert(RequestObject::new(
            RequestKind::Receive,
            1,
            Payload::Receive { dest, data: None },
        ))?;
        // reference of the posted receive, dropped on delivery
        registry.add_ref(request)?;

        let posted = PostedReceive {
            request,
            source,
            tag,
            context,
        };
        let mailbox = channel.mailbox(dest);
        let index = mailbox
            .unexpected
            .iter()
            .position(|message| posted.matches(message));
        match index.and_then(|index| mailbox.unexpected.remove(index)) {
            Some(message) => {
                trace!("receive {:#x} matched unexpected message from {}", request, message.source);
                deliver(&mut registry, request, message)?;
            }
            None => mailbox.posted.push_back(posted),
        }
        drop(registry);
        drop(channel);
        self.notify_completion();
        Ok(request)
    }

    /// Cancels a receive that has not been matched or a synchronous send whose message has not
    /// been received.  Anything else has progressed too far and is left alone.
    pub(crate) fn cancel_native(&self, request: RawRequest, dest: Rank) -> Result<()> {
        let mut channel = self.transport.channel(dest);
        let mut registry = self.enter();
        let mailbox = channel.mailbox(dest);

        let found = if let Some(index) = mailbox.posted.iter().position(|p| p.request == request) {
            mailbox.posted.remove(index);
            true
        } else if let Some(index) = mailbox
            .unexpected
            .iter()
            .position(|message| message.sender == Some(request))
        {
            mailbox.unexpected.remove(index);
            true
        } else {
            false
        };

        if found {
            let object = registry.lookup_object_mut(request)?;
            object.status = Status::empty();
            object.status.set_cancelled(true);
            registry.mark_complete(request, 1)?;
            registry.release_ref(request);
            trace!("cancelled request {:#x}", request);
        }
        drop(registry);
        drop(channel);
        if found {
            self.notify_completion();
        }
        Ok(())
    }

    fn partitioned_init(
        &self,
        source: Rank,
        dest: Rank,
        tag: Tag,
        partitions: usize,
    ) -> Result<RawRequest> {
        self.transport.check_rank(source)?;
        self.transport.check_rank(dest)?;
        if partitions == 0 {
            return Err(Error::InvalidArgument("a partitioned send needs at least one partition"));
        }

        let request = self.enter().insert(RequestObject::new(
            RequestKind::Partitioned,
            partitions,
            Payload::Partitioned {
                source,
                dest,
                tag,
                parts: vec![None; partitions],
            },
        ))?;
        trace!("partitioned send {:#x}: {} -> {} in {} parts", request, source, dest, partitions);
        Ok(request)
    }

    fn partition_ready(&self, request: RawRequest, partition: usize, data: Vec<u8>) -> Result<()> {
        let dest = match self.enter().lookup(request)?.payload {
            Payload::Partitioned { dest, .. } => dest,
            _ => {
                return Err(Error::WrongKind {
                    request,
                    expected: RequestKind::Partitioned.name(),
                })
            }
        };

        let mut channel = self.transport.channel(dest);
        let mut registry = self.enter();
        let (source, tag, assembled) = {
            let object = registry.lookup_mut(request)?;
            if object.is_complete() {
                return Err(Error::AlreadyCompleted(request));
            }
            let (source, tag, parts) = match object.payload {
                Payload::Partitioned {
                    source,
                    tag,
                    ref mut parts,
                    ..
                } => (source, tag, parts),
                _ => unreachable!("request kind is immutable"),
            };
            match parts.get_mut(partition) {
                Some(part) if part.is_none() => *part = Some(data),
                _ => return Err(Error::Partition { request, partition }),
            }
            let assembled = if parts.iter().all(Option::is_some) {
                Some(
                    parts
                        .iter_mut()
                        .flat_map(|part| part.take().unwrap_or_default())
                        .collect::<Vec<u8>>(),
                )
            } else {
                None
            };
            (source, tag, assembled)
        };

        if let Some(data) = assembled {
            let object = registry.lookup_mut(request)?;
            object.status.set_source_rank(Some(source));
            object.status.set_tag(Some(tag));
            object.status.set_count(data.len());
            route(
                &mut registry,
                channel.mailbox(dest),
                Message {
                    source,
                    tag,
                    context: Context::PointToPoint,
                    data,
                    sender: None,
                },
            )?;
        }
        registry.mark_complete(request, 1)?;
        drop(registry);
        drop(channel);
        self.notify_completion();
        Ok(())
    }
}

impl Universe {
    /// Number of local endpoints served by the transport.
    pub fn size(&self) -> usize {
        self.runtime.transport.endpoints()
    }

    /// Initiates a standard mode send of `data` from `source` to `dest`.
    ///
    /// The message is buffered, so the request is complete as soon as this returns.
    ///
    /// # Standard section(s)
    ///
    /// 3.7.2
    pub fn immediate_send(&self, source: Rank, dest: Rank, tag: Tag, data: Vec<u8>) -> Result<RawRequest> {
        self.runtime
            .send(source, dest, tag, Context::PointToPoint, data, false)
    }

    /// Initiates a synchronous mode send.  The request completes once a receive has matched the
    /// message.  Until then it can be cancelled.
    ///
    /// # Standard section(s)
    ///
    /// 3.7.2
    pub fn immediate_synchronous_send(
        &self,
        source: Rank,
        dest: Rank,
        tag: Tag,
        data: Vec<u8>,
    ) -> Result<RawRequest> {
        self.runtime
            .send(source, dest, tag, Context::PointToPoint, data, true)
    }

    /// Initiates a send on behalf of a collective operation.  Collective traffic is matched
    /// separately from point to point traffic.
    pub fn immediate_send_collective(
        &self,
        source: Rank,
        dest: Rank,
        tag: Tag,
        data: Vec<u8>,
    ) -> Result<RawRequest> {
        self.runtime
            .send(source, dest, tag, Context::Collective, data, false)
    }

    /// Initiates a receive at endpoint `dest`.  `None` as `source` or `tag` matches any source or
    /// tag.
    ///
    /// # Standard section(s)
    ///
    /// 3.7.2
    pub fn immediate_receive(
        &self,
        dest: Rank,
        source: Option<Rank>,
        tag: Option<Tag>,
    ) -> Result<RawRequest> {
        self.runtime.receive(dest, source, tag, Context::PointToPoint)
    }

    /// Initiates a receive of collective traffic.
    pub fn immediate_receive_collective(
        &self,
        dest: Rank,
        source: Option<Rank>,
        tag: Option<Tag>,
    ) -> Result<RawRequest> {
        self.runtime.receive(dest, source, tag, Context::Collective)
    }

    /// Creates a partitioned send of `partitions` parts.  The request completes once every
    /// partition has been marked ready, at which point the parts are sent as one message.
    ///
    /// # Standard section(s)
    ///
    /// 4.2
    pub fn partitioned_send_init(
        &self,
        source: Rank,
        dest: Rank,
        tag: Tag,
        partitions: usize,
    ) -> Result<RawRequest> {
        self.runtime.partitioned_init(source, dest, tag, partitions)
    }

    /// Marks one partition of a partitioned send ready.
    ///
    /// # Errors
    ///
    /// `WrongKind` for requests that are not partitioned sends, `Partition` if the partition is
    /// out of range or was already marked ready.
    pub fn pready(&self, request: RawRequest, partition: usize, data: Vec<u8>) -> Result<()> {
        self.runtime
            .partition_ready(request, partition, data)
            .map_err(|err| err.context("pready", request))
    }
}
