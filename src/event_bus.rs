use std::{
    sync::mpsc::{Receiver, RecvTimeoutError, TryRecvError},
    thread::{self, JoinHandle},
    time::Duration,
};

use crate::{events::*, logging::Logger};

pub(crate) type HandlerPtr<T> = Box<dyn Fn(&T) + Send>;

/// User-registered (and, if enabled, logging) handlers for every event type.
pub(crate) struct EventHandlers {
    pub(crate) receive_consensus_handlers: Vec<HandlerPtr<ReceiveConsensusEvent>>,
    pub(crate) receive_vote_handlers: Vec<HandlerPtr<ReceiveVoteEvent>>,
    pub(crate) reject_message_handlers: Vec<HandlerPtr<RejectMessageEvent>>,
    pub(crate) equivocation_detected_handlers: Vec<HandlerPtr<EquivocationDetectedEvent>>,
    pub(crate) preprepare_handlers: Vec<HandlerPtr<PreprepareEvent>>,
    pub(crate) vote_handlers: Vec<HandlerPtr<VoteEvent>>,
    pub(crate) reply_handlers: Vec<HandlerPtr<ReplyEvent>>,
    pub(crate) delivery_attempted_handlers: Vec<HandlerPtr<DeliveryAttemptedEvent>>,
    pub(crate) collect_quorum_handlers: Vec<HandlerPtr<CollectQuorumEvent>>,
    pub(crate) finalize_handlers: Vec<HandlerPtr<FinalizeEvent>>,
    pub(crate) confirmed_handlers: Vec<HandlerPtr<ConfirmedEvent>>,
}

/// Fill one handler list: the user's handler, if any, then the default logger, if enabled.
fn handlers_for<T: Logger>(handler: Option<HandlerPtr<T>>, log_events: bool) -> Vec<HandlerPtr<T>> {
    let mut handlers = Vec::new();
    if let Some(handler) = handler {
        handlers.push(handler)
    }
    if log_events {
        handlers.push(T::get_logger())
    }
    handlers
}

impl EventHandlers {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        log_events: bool,
        receive_consensus_handler: Option<HandlerPtr<ReceiveConsensusEvent>>,
        receive_vote_handler: Option<HandlerPtr<ReceiveVoteEvent>>,
        reject_message_handler: Option<HandlerPtr<RejectMessageEvent>>,
        equivocation_detected_handler: Option<HandlerPtr<EquivocationDetectedEvent>>,
        preprepare_handler: Option<HandlerPtr<PreprepareEvent>>,
        vote_handler: Option<HandlerPtr<VoteEvent>>,
        reply_handler: Option<HandlerPtr<ReplyEvent>>,
        delivery_attempted_handler: Option<HandlerPtr<DeliveryAttemptedEvent>>,
        collect_quorum_handler: Option<HandlerPtr<CollectQuorumEvent>>,
        finalize_handler: Option<HandlerPtr<FinalizeEvent>>,
        confirmed_handler: Option<HandlerPtr<ConfirmedEvent>>,
    ) -> EventHandlers {
        EventHandlers {
            receive_consensus_handlers: handlers_for(receive_consensus_handler, log_events),
            receive_vote_handlers: handlers_for(receive_vote_handler, log_events),
            reject_message_handlers: handlers_for(reject_message_handler, log_events),
            equivocation_detected_handlers: handlers_for(equivocation_detected_handler, log_events),
            preprepare_handlers: handlers_for(preprepare_handler, log_events),
            vote_handlers: handlers_for(vote_handler, log_events),
            reply_handlers: handlers_for(reply_handler, log_events),
            delivery_attempted_handlers: handlers_for(delivery_attempted_handler, log_events),
            collect_quorum_handlers: handlers_for(collect_quorum_handler, log_events),
            finalize_handlers: handlers_for(finalize_handler, log_events),
            confirmed_handlers: handlers_for(confirmed_handler, log_events),
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.receive_consensus_handlers.is_empty()
            && self.receive_vote_handlers.is_empty()
            && self.reject_message_handlers.is_empty()
            && self.equivocation_detected_handlers.is_empty()
            && self.preprepare_handlers.is_empty()
            && self.vote_handlers.is_empty()
            && self.reply_handlers.is_empty()
            && self.delivery_attempted_handlers.is_empty()
            && self.collect_quorum_handlers.is_empty()
            && self.finalize_handlers.is_empty()
            && self.confirmed_handlers.is_empty()
    }

    pub(crate) fn fire_handlers(&self, event: Event) {
        match event {
            Event::ReceiveConsensus(event) =>
                self.receive_consensus_handlers.iter().for_each(|handler| handler(&event)),

            Event::ReceiveVote(event) =>
                self.receive_vote_handlers.iter().for_each(|handler| handler(&event)),

            Event::RejectMessage(event) =>
                self.reject_message_handlers.iter().for_each(|handler| handler(&event)),

            Event::EquivocationDetected(event) =>
                self.equivocation_detected_handlers.iter().for_each(|handler| handler(&event)),

            Event::Preprepare(event) =>
                self.preprepare_handlers.iter().for_each(|handler| handler(&event)),

            Event::Vote(event) =>
                self.vote_handlers.iter().for_each(|handler| handler(&event)),

            Event::Reply(event) =>
                self.reply_handlers.iter().for_each(|handler| handler(&event)),

            Event::DeliveryAttempted(event) =>
                self.delivery_attempted_handlers.iter().for_each(|handler| handler(&event)),

            Event::CollectQuorum(event) =>
                self.collect_quorum_handlers.iter().for_each(|handler| handler(&event)),

            Event::Finalize(event) =>
                self.finalize_handlers.iter().for_each(|handler| handler(&event)),

            Event::Confirmed(event) =>
                self.confirmed_handlers.iter().for_each(|handler| handler(&event)),
        }
    }
}

pub(crate) fn start_event_bus(
    event_handlers: EventHandlers,
    event_subscriber: Receiver<Event>,
    shutdown_signal: Receiver<()>,
) -> JoinHandle<()> {
    thread::spawn(move || loop {
        match shutdown_signal.try_recv() {
            Ok(()) | Err(TryRecvError::Disconnected) => return,
            Err(TryRecvError::Empty) => (),
        }

        match event_subscriber.recv_timeout(Duration::from_millis(20)) {
            Ok(event) => event_handlers.fire_handlers(event),
            Err(RecvTimeoutError::Timeout) => (),
            Err(RecvTimeoutError::Disconnected) => return,
        }
    })
}
