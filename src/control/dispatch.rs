//! Command dispatch onto the robot session and relay

use uuid::Uuid;

use super::protocol::{ClientCommand, ServerMessage};
use crate::robot::RobotTarget;
use crate::state::AppState;

/// Run `command`, returning the reply (if the command has one)
pub async fn dispatch(state: &AppState, command: ClientCommand) -> Option<ServerMessage> {
    match command {
        ClientCommand::Connect { ip, target } => {
            let config = state.config.get();
            let target = match (target, ip) {
                (Some(target), _) => target,
                (None, Some(ip)) => RobotTarget::from_ip(ip),
                (None, None) => config.robot.target.clone(),
            };
            let result = state
                .robot
                .connect(target, config.robot.connect_timeout())
                .await;
            Some(ServerMessage::from_result(result))
        }
        ClientCommand::Disconnect => {
            state.robot.disconnect().await;
            Some(ServerMessage::ok())
        }
        ClientCommand::Subscribe { switch } => {
            Some(ServerMessage::from_result(state.robot.set_telemetry(switch).await))
        }
        ClientCommand::VideoOffer { connection_id, sdp } => {
            let connection_id = connection_id.unwrap_or_else(|| Uuid::new_v4().to_string());
            match state.relay.handle_offer(&connection_id, &sdp).await {
                Ok(sdp) => Some(ServerMessage::VideoAnswer { connection_id, sdp }),
                Err(e) => Some(ServerMessage::error(&e)),
            }
        }
        ClientCommand::IceCandidate {
            connection_id,
            candidate,
        } => {
            state.relay.add_ice_candidate(&connection_id, candidate).await;
            None
        }
        ClientCommand::VideoClose { connection_id } => {
            state.relay.close_connection(&connection_id).await;
            Some(ServerMessage::ok())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_state;

    async fn send(state: &AppState, text: &str) -> Option<ServerMessage> {
        dispatch(state, ClientCommand::parse(text).unwrap()).await
    }

    #[tokio::test]
    async fn test_connect_by_ip_then_disconnect() {
        let (state, connector, _engine) = test_state();
        let reply = send(&state, r#"{"command":"connect","ip":"10.0.0.7"}"#)
            .await
            .unwrap();
        assert_eq!(reply, ServerMessage::ok());
        assert_eq!(
            connector.last_target(),
            Some(RobotTarget::from_ip("10.0.0.7"))
        );
        assert!(state.robot.is_connected());

        let reply = send(&state, r#"{"command":"disconnect"}"#)
            .await
            .unwrap();
        assert_eq!(reply, ServerMessage::ok());
        assert!(!state.robot.is_connected());
    }

    #[tokio::test]
    async fn test_connect_without_target_uses_configured_one() {
        let (state, connector, _engine) = test_state();
        send(&state, r#"{"command":"connect"}"#).await.unwrap();
        assert_eq!(connector.last_target(), Some(RobotTarget::LocalAp));
    }

    #[tokio::test]
    async fn test_offer_without_id_gets_fresh_id() {
        let (state, _connector, _engine) = test_state();
        let reply = send(&state, r#"{"command":"video_offer","sdp":"v=0"}"#)
            .await
            .unwrap();
        match reply {
            ServerMessage::VideoAnswer { connection_id, sdp } => {
                assert!(Uuid::parse_str(&connection_id).is_ok());
                assert_eq!(sdp, format!("answer:{}:v=0", connection_id));
            }
            other => panic!("unexpected reply: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_ice_has_no_reply_and_close_is_idempotent() {
        let (state, _connector, _engine) = test_state();
        let reply = send(
            &state,
            r#"{"command":"ice_candidate","connection_id":"ghost","candidate":{"candidate":"candidate:1"}}"#,
        )
        .await;
        assert!(reply.is_none());

        for _ in 0..2 {
            let reply = send(&state, r#"{"command":"video_close","connection_id":"ghost"}"#)
                .await
                .unwrap();
            assert_eq!(reply, ServerMessage::ok());
        }
    }

    #[tokio::test]
    async fn test_failed_offer_is_reported() {
        let (state, _connector, _engine) = test_state();
        let reply = send(
            &state,
            r#"{"command":"video_offer","connection_id":"v1","sdp":"bad"}"#,
        )
        .await
        .unwrap();
        assert!(matches!(reply, ServerMessage::CommandResult { ok: false, .. }));
        assert_eq!(state.relay.connection_count().await, 1);
    }

    #[tokio::test]
    async fn test_subscribe_requires_connected_robot() {
        let (state, _connector, _engine) = test_state();
        let reply = send(&state, r#"{"command":"subscribe","switch":true}"#)
            .await
            .unwrap();
        assert!(matches!(reply, ServerMessage::CommandResult { ok: false, .. }));

        send(&state, r#"{"command":"connect"}"#).await.unwrap();
        let reply = send(&state, r#"{"command":"subscribe","switch":true}"#)
            .await
            .unwrap();
        assert_eq!(reply, ServerMessage::ok());
        let reply = send(&state, r#"{"command":"subscribe","switch":false}"#)
            .await
            .unwrap();
        assert_eq!(reply, ServerMessage::ok());
    }
}
