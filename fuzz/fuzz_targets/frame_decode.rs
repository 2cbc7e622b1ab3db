//! Fuzz harness for inbound frame decoding.
//!
//! Feeds arbitrary bytes through the handshake parser and, as a session
//! frame body, through tag parsing and the payload decoder the server would
//! pick for that tag. None of them may panic.

#![no_main]
use bytes::Bytes;
use libfuzzer_sys::fuzz_target;
use thanatos_daemon::protocol::messages::{
    AppPolicyConfig, Empty, FrameworkEvent, LaunchRule, RecentEventsRequest, RpcStatus,
    TemporaryUnfreezeRequest,
};
use thanatos_daemon::protocol::{Frame, FrameKind, HandshakeMessage, RpcMethod};

fuzz_target!(|data: &[u8]| {
    let body = Bytes::copy_from_slice(data);
    let _ = HandshakeMessage::parse(&body);

    let Ok(frame) = Frame::parse(body) else {
        return;
    };
    match frame.kind {
        FrameKind::Call(RpcMethod::SetAppConfig) => {
            let _ = frame.decode::<AppPolicyConfig>("AppPolicyConfig");
        },
        FrameKind::Call(RpcMethod::SetLaunchRule | RpcMethod::ShouldAllowLaunch) => {
            let _ = frame.decode::<LaunchRule>("LaunchRule");
        },
        FrameKind::Call(RpcMethod::RequestTemporaryUnfreeze) => {
            let _ = frame.decode::<TemporaryUnfreezeRequest>("TemporaryUnfreezeRequest");
        },
        FrameKind::Call(RpcMethod::GetRecentEvents) => {
            let _ = frame.decode::<RecentEventsRequest>("RecentEventsRequest");
        },
        FrameKind::Call(RpcMethod::PushFrameworkEvents | RpcMethod::StreamRuntimeStats)
        | FrameKind::Cancel => {
            let _ = frame.decode::<Empty>("Empty");
        },
        FrameKind::StreamItem => {
            let _ = frame.decode::<FrameworkEvent>("FrameworkEvent");
        },
        FrameKind::StreamEnd | FrameKind::Error => {
            let _ = frame.decode::<RpcStatus>("RpcStatus");
        },
    }
});
