// Pecunia schema - progress and gamification tables for Diesel ORM

diesel::table! {
    schema_versions (id) {
        id -> Integer,
        version -> Text,
        name -> Text,
        features -> Text,
        introduced_at -> Text,
    }
}

diesel::table! {
    users (id) {
        id -> Integer,
        handle -> Text,
        email -> Text,
        display_name -> Text,
        points -> Integer,
        best_trivia_score -> Integer,
        created_at -> Text,
    }
}

// ============================================================================
// Ledger
// ============================================================================

diesel::table! {
    expenses (id) {
        id -> Integer,
        user_id -> Integer,
        amount -> Double,
        category -> Text,            // 'food', 'education', 'clothing', 'other', 'savings'
        store_name -> Text,
        spent_at -> Text,
    }
}

// ============================================================================
// Challenges
// ============================================================================

diesel::table! {
    challenge_definitions (id) {
        id -> Integer,
        code -> Text,
        title -> Text,
        kind -> Text,                // 'savings' or 'spending_cap'
        goal_amount -> Double,
        duration_days -> Integer,
        points -> Integer,
        is_active -> Bool,
    }
}

diesel::table! {
    challenge_enrollments (id) {
        id -> Integer,
        user_id -> Integer,
        definition_id -> Integer,
        started_at -> Text,
        state -> Text,               // 'active', 'completed', 'failed'
        earned_points -> Integer,
        closed_at -> Nullable<Text>,
    }
}

// ============================================================================
// Assessments and metrics
// ============================================================================

diesel::table! {
    assessments (id) {
        id -> Integer,
        user_id -> Integer,
        sequence_number -> Integer,
        taken_at -> Text,
        budgeting -> Integer,
        saving -> Integer,
        credit -> Integer,
        investing -> Integer,
        fraud_awareness -> Integer,
        has_cards -> Bool,
        card_count -> Integer,
        debt_amount -> Double,
        min_payment_frequency -> Integer,
        fraud_experience -> Bool,
        theory_score -> Integer,
        practice_score -> Integer,
        total_score -> Integer,
        level -> Text,
    }
}

diesel::table! {
    user_metrics (user_id) {
        user_id -> Integer,
        registered_at -> Text,
        last_activity_at -> Text,
        active_days -> Integer,
        total_sessions -> Integer,
        total_usage_hours -> Double,
        initial_score -> Integer,
        current_score -> Integer,
        improvement_pct -> Double,
        challenges_completed -> Integer,
        total_points -> Integer,
    }
}

diesel::table! {
    activity_days (user_id, day) {
        user_id -> Integer,
        day -> Text,                 // YYYY-MM-DD (UTC)
    }
}

// ============================================================================
// Achievements and storylines
// ============================================================================

diesel::table! {
    achievement_definitions (id) {
        id -> Integer,
        code -> Text,
        title -> Text,
        description -> Text,
        bonus_points -> Integer,
        rule_json -> Text,
        is_active -> Bool,
    }
}

diesel::table! {
    achievement_unlocks (id) {
        id -> Integer,
        user_id -> Integer,
        achievement_id -> Integer,
        unlocked_at -> Text,
        progress -> Double,
    }
}

diesel::table! {
    content_views (user_id, content_id) {
        user_id -> Integer,
        content_id -> Text,
        viewed_at -> Text,
    }
}

diesel::table! {
    storylines (id) {
        id -> Integer,
        chapter_number -> Integer,
        title -> Text,
        body -> Text,
    }
}

diesel::table! {
    story_progress (user_id, storyline_id) {
        user_id -> Integer,
        storyline_id -> Integer,
        completed -> Bool,
        completed_at -> Nullable<Text>,
    }
}

// ============================================================================
// Games and precached content
// ============================================================================

diesel::table! {
    game_scores (user_id, game) {
        user_id -> Integer,
        game -> Text,                // 'trivia' or 'phrases'
        total_points -> Integer,
        best_round -> Integer,
        rounds -> Integer,
        correct -> Integer,
        partial -> Integer,
        incorrect -> Integer,
        updated_at -> Text,
    }
}

diesel::table! {
    trivia_questions (id) {
        id -> Integer,
        prompt -> Text,
        options_json -> Text,        // {"a": "...", "b": "..."}
        correct_key -> Text,
    }
}

diesel::table! {
    precached_items (id) {
        id -> Integer,
        user_id -> Integer,
        kind -> Text,                // 'question_bundle' or 'phrase'
        payload_json -> Text,
        used -> Bool,
        created_at -> Text,
        used_at -> Nullable<Text>,
    }
}

diesel::allow_tables_to_appear_in_same_query!(
    users,
    expenses,
    challenge_definitions,
    challenge_enrollments,
    assessments,
    user_metrics,
    achievement_definitions,
    achievement_unlocks,
    storylines,
    story_progress,
);
