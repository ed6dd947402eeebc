use super::*;

fn message(id: &str, client_id: Option<&str>) -> Message {
    Message {
        id: id.to_owned(),
        client_id: client_id.map(str::to_owned),
        content: "hello".into(),
        sender_id: "u1".into(),
        sender_name: "Ada".into(),
        sender_role: "member".into(),
        channel_id: "c1".into(),
        channel_type: ChannelType::ProjectGeneral,
        timestamp: 1_000,
        status: MessageStatus::Sending,
        read_by: BTreeSet::new(),
        attachments: Vec::new(),
        ack_overdue: false,
    }
}

#[test]
fn status_transitions_only_move_forward() {
    use MessageStatus::*;
    assert!(Sending.can_advance_to(Sent));
    assert!(Sending.can_advance_to(Failed));
    assert!(Sent.can_advance_to(Delivered));
    assert!(Delivered.can_advance_to(Read));
    assert!(Sent.can_advance_to(Read));

    assert!(!Read.can_advance_to(Delivered));
    assert!(!Delivered.can_advance_to(Sent));
    assert!(!Sent.can_advance_to(Sending));
    assert!(!Sent.can_advance_to(Failed));
    assert!(!Failed.can_advance_to(Sent));
    assert!(!Sent.can_advance_to(Sent));
}

#[test]
fn advance_clears_ack_overdue_on_delivery() {
    let mut msg = message("m1", None);
    assert!(msg.advance(MessageStatus::Sent));
    msg.ack_overdue = true;
    assert!(msg.advance(MessageStatus::Delivered));
    assert!(!msg.ack_overdue);
    assert!(!msg.advance(MessageStatus::Sent));
    assert_eq!(msg.status, MessageStatus::Delivered);
}

#[test]
fn same_message_matches_server_or_client_id() {
    let pending = message("local-1", Some("local-1"));
    let confirmed = message("srv-9", Some("local-1"));
    let other = message("srv-10", Some("local-2"));
    assert!(pending.same_message(&confirmed));
    assert!(confirmed.same_message(&pending));
    assert!(!pending.same_message(&other));
}

#[test]
fn message_wire_names_are_camel_case() {
    let msg = message("m1", None);
    let json = serde_json::to_value(&msg).expect("serialize");
    assert_eq!(json["senderId"], "u1");
    assert_eq!(json["channelType"], "PROJECT_GENERAL");
    assert_eq!(json["status"], "SENDING");
    assert!(json.get("clientId").is_none());
    assert!(json.get("ackOverdue").is_none());
}

#[test]
fn presence_availability_prefers_online() {
    let mut statuses = [PresenceStatus::Offline, PresenceStatus::Online, PresenceStatus::Away, PresenceStatus::Busy];
    statuses.sort_by_key(|s| std::cmp::Reverse(s.availability()));
    assert_eq!(statuses[0], PresenceStatus::Online);
    assert_eq!(statuses[1], PresenceStatus::Busy);
    assert_eq!(statuses[3], PresenceStatus::Offline);
}

#[test]
fn channel_type_parses_its_own_names() {
    for ty in [ChannelType::ProjectGeneral, ChannelType::ProjectTeam, ChannelType::DirectMessage] {
        assert_eq!(ChannelType::parse(ty.as_str()), Some(ty));
    }
    assert_eq!(ChannelType::parse("GROUP"), None);
}
