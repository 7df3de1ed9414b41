diesel::table! {
    tickets (id) {
        id -> Int4,
        concert_id -> Int4,
        availability -> Int4,
    }
}

diesel::table! {
    orders (id) {
        id -> Int4,
        request_id -> Varchar,
        user_id -> Int4,
        status -> Varchar,
        reject_reason -> Nullable<Varchar>,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    order_details (id) {
        id -> Int4,
        order_id -> Int4,
        ticket_id -> Int4,
        quantity -> Int4,
    }
}

diesel::table! {
    outbox_events (id) {
        id -> Uuid,
        request_id -> Varchar,
        event_type -> Varchar,
        event_data -> Jsonb,
        processed -> Bool,
        created_at -> Timestamptz,
    }
}

diesel::joinable!(order_details -> orders (order_id));

diesel::allow_tables_to_appear_in_same_query!(
    tickets,
    orders,
    order_details,
    outbox_events,
);
