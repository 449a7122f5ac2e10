mod helpers;

use helpers::{grant_consent, FarmerBuilder, FieldBuilder, TestApp, UserBuilder};
use krishi_sakhi::storage;
use krishi_sakhi::types::ConsentKind;
use reqwest::StatusCode;
use serde_json::{json, Value};

#[tokio::test]
async fn test_health_and_jwks() {
    let app = TestApp::spawn().await;

    let resp = app.client.get(app.url("/health")).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(
        resp.headers().get("x-content-type-options").unwrap(),
        "nosniff"
    );
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["database"], "ok");

    let jwks: Value = app
        .client
        .get(app.url("/.well-known/jwks.json"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(jwks["keys"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_otp_login_and_refresh() {
    let app = TestApp::spawn().await;

    let started: Value = app
        .client
        .post(app.url("/auth/otp/start"))
        .json(&json!({"phone": "+919876543210"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let req_id = started["req_id"].as_str().unwrap().to_string();

    let wrong = app
        .client
        .post(app.url("/auth/otp/verify"))
        .json(&json!({"req_id": req_id, "code": "123456"}))
        .send()
        .await
        .unwrap();
    assert_eq!(wrong.status(), StatusCode::UNAUTHORIZED);

    let login: Value = app
        .client
        .post(app.url("/auth/otp/verify"))
        .json(&json!({"req_id": req_id, "code": "000000"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(login["is_new_user"], true);
    assert_eq!(login["token_type"], "bearer");
    let access = login["access_token"].as_str().unwrap();
    let refresh = login["refresh_token"].as_str().unwrap().to_string();

    let me: Value = app
        .get("/auth/me", access)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(me["user"]["phone"], "+919876543210");
    assert!(me["farmer"].is_null());

    let rotated = app
        .client
        .post(app.url("/auth/refresh"))
        .json(&json!({"refresh_token": refresh}))
        .send()
        .await
        .unwrap();
    assert_eq!(rotated.status(), StatusCode::OK);

    // A refresh token is single use
    let replay = app
        .client
        .post(app.url("/auth/refresh"))
        .json(&json!({"refresh_token": refresh}))
        .send()
        .await
        .unwrap();
    assert_eq!(replay.status(), StatusCode::UNAUTHORIZED);

    // Failed and successful logins are both audited
    let (logs, _) = storage::list_audit_logs(
        app.db(),
        &storage::AuditFilter::default(),
        storage::Page::new(None, None).unwrap(),
    )
    .await
    .unwrap();
    assert!(logs.iter().any(|l| l.action == "login" && !l.success));
    assert!(logs.iter().any(|l| l.action == "login" && l.success));
}

#[tokio::test]
async fn test_missing_token_is_rejected() {
    let app = TestApp::spawn().await;
    let resp = app.client.get(app.url("/auth/me")).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "unauthorized");
}

#[tokio::test]
async fn test_farmer_profile_and_access_control() {
    let app = TestApp::spawn().await;
    let owner = UserBuilder::new("+919000000001").create(app.db()).await;
    let other = UserBuilder::new("+919000000002").create(app.db()).await;
    let staff = UserBuilder::new("+919000000003").staff().create(app.db()).await;
    let owner_token = app.token_for(&owner).await;
    let other_token = app.token_for(&other).await;
    let staff_token = app.token_for(&staff).await;

    let resp = app
        .post("/farmers", &owner_token)
        .json(&json!({
            "name": "Lakshmi",
            "district": "Palakkad",
            "primary_crops": ["rice", "banana"]
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CREATED);
    let farmer: Value = resp.json().await.unwrap();
    let farmer_id = farmer["id"].as_str().unwrap();
    assert_eq!(farmer["primary_crops"], json!(["rice", "banana"]));

    // A second profile for the same user conflicts
    let dup = app
        .post("/farmers", &owner_token)
        .json(&json!({"name": "Again", "district": "Palakkad"}))
        .send()
        .await
        .unwrap();
    assert_eq!(dup.status(), StatusCode::CONFLICT);

    let forbidden = app
        .get(&format!("/farmers/{}", farmer_id), &other_token)
        .send()
        .await
        .unwrap();
    assert_eq!(forbidden.status(), StatusCode::FORBIDDEN);

    let as_staff = app
        .get(&format!("/farmers/{}", farmer_id), &staff_token)
        .send()
        .await
        .unwrap();
    assert_eq!(as_staff.status(), StatusCode::OK);

    let farm: Value = app
        .post(&format!("/farmers/{}/farms", farmer_id), &owner_token)
        .json(&json!({"name": "River side", "area_ha": 0.8}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let field = app
        .post(&format!("/farms/{}/fields", farm["id"].as_str().unwrap()), &owner_token)
        .json(&json!({"name": "North plot", "crop": "rice", "stage": "tillering"}))
        .send()
        .await
        .unwrap();
    assert_eq!(field.status(), StatusCode::CREATED);

    let patched: Value = app
        .patch(&format!("/farmers/{}", farmer_id), &owner_token)
        .json(&json!({"village": "Alathur"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(patched["village"], "Alathur");

    let listing = app.get("/farmers", &owner_token).send().await.unwrap();
    assert_eq!(listing.status(), StatusCode::FORBIDDEN);
    let listing: Value = app
        .get("/farmers?district=Palakkad", &staff_token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(listing["total"], 1);
}

#[tokio::test]
async fn test_activity_logging_requires_consent() {
    let app = TestApp::spawn().await;
    let user = UserBuilder::new("+919000000010").create(app.db()).await;
    let (farmer, farm) = FarmerBuilder::new(&user.id).create(app.db()).await;
    let field = FieldBuilder::new(&farm.id).crop("rice").create(app.db()).await;
    let token = app.token_for(&user).await;

    let body = json!({
        "farmer_id": farmer.id,
        "field_id": field.id,
        "text": "Today I sowed rice seeds, 5 kg",
        "language": "en"
    });

    let denied = app
        .post("/activities/log", &token)
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(denied.status(), StatusCode::FORBIDDEN);

    grant_consent(app.db(), &user.id, ConsentKind::DataProcessing).await;

    let resp = app
        .post("/activities/log", &token)
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CREATED);
    let activity: Value = resp.json().await.unwrap();
    assert_eq!(activity["kind"], "sowing");
    assert_eq!(activity["intent"], "log_activity");
    assert_eq!(activity["field_id"], field.id.as_str());

    let empty = app
        .post("/activities/log", &token)
        .json(&json!({"farmer_id": farmer.id, "text": "   "}))
        .send()
        .await
        .unwrap();
    assert_eq!(empty.status(), StatusCode::BAD_REQUEST);

    let listed: Value = app
        .get(&format!("/activities?farmer_id={}", farmer.id), &token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(listed["total"], 1);
    assert_eq!(listed["activities"][0]["id"], activity["id"]);

    // Farmers must name whose activities they want
    let unscoped = app.get("/activities", &token).send().await.unwrap();
    assert_eq!(unscoped.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_advisory_generation_from_weather() {
    let app = TestApp::spawn().await;
    let user = UserBuilder::new("+919000000020").create(app.db()).await;
    let staff = UserBuilder::new("+919000000021").staff().create(app.db()).await;
    let (farmer, _farm) = FarmerBuilder::new(&user.id)
        .in_district("Wayanad")
        .create(app.db())
        .await;
    let token = app.token_for(&user).await;
    let staff_token = app.token_for(&staff).await;

    // Farmers cannot feed external data
    let denied = app
        .post("/ext/weather", &token)
        .json(&json!({"district": "Wayanad", "rain_24h_mm": 40.0}))
        .send()
        .await
        .unwrap();
    assert_eq!(denied.status(), StatusCode::FORBIDDEN);

    let obs = app
        .post("/ext/weather", &staff_token)
        .json(&json!({"district": "Wayanad", "rain_24h_mm": 40.0, "temp_max_c": 30.0}))
        .send()
        .await
        .unwrap();
    assert_eq!(obs.status(), StatusCode::CREATED);

    let generated: Value = app
        .post("/advisories/generate", &token)
        .json(&json!({"farmer_id": farmer.id}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let titles: Vec<&str> = generated["advisories"]
        .as_array()
        .unwrap()
        .iter()
        .map(|a| a["title"].as_str().unwrap())
        .collect();
    assert!(titles.contains(&"Weather Advisory - Rain"));

    // Same facts within the window produce nothing new
    let again: Value = app
        .post("/advisories/generate", &token)
        .json(&json!({"farmer_id": farmer.id}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(again["generated"], 0);

    let list: Value = app
        .get("/advisories?unread_only=true", &token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let first = list["advisories"][0]["id"].as_str().unwrap().to_string();

    let read = app
        .post(&format!("/advisories/{}/read", first), &token)
        .send()
        .await
        .unwrap();
    assert_eq!(read.status(), StatusCode::OK);
    let ack: Value = app
        .post(&format!("/advisories/{}/ack", first), &token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(ack["is_acknowledged"], true);
}

#[tokio::test]
async fn test_reminder_lifecycle() {
    let app = TestApp::spawn().await;
    let user = UserBuilder::new("+919000000030").create(app.db()).await;
    FarmerBuilder::new(&user.id).create(app.db()).await;
    let token = app.token_for(&user).await;

    let due = chrono::Utc::now().timestamp() + 3600;
    let resp = app
        .post("/reminders", &token)
        .json(&json!({
            "kind": "irrigation",
            "title": "Water the paddy",
            "due_ts": due,
            "repeat_every_secs": 86400
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CREATED);
    let reminder: Value = resp.json().await.unwrap();
    let path = format!("/reminders/{}", reminder["id"].as_str().unwrap());

    let too_short = app
        .post("/reminders", &token)
        .json(&json!({
            "kind": "irrigation",
            "title": "Spam",
            "due_ts": due,
            "repeat_every_secs": 5
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(too_short.status(), StatusCode::BAD_REQUEST);

    let paused: Value = app
        .post(&format!("{}/pause", path), &token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(paused["is_paused"], true);

    let resumed: Value = app
        .post(&format!("{}/resume", path), &token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(resumed["is_paused"], false);

    let listed: Vec<Value> = app
        .get("/reminders", &token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(listed.len(), 1);

    let deleted = app.delete(&path, &token).send().await.unwrap();
    assert_eq!(deleted.status(), StatusCode::OK);
    let gone = app.get(&path, &token).send().await.unwrap();
    assert_eq!(gone.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_knowledge_base_ingest_and_search() {
    let app = TestApp::spawn().await;
    let farmer = UserBuilder::new("+919000000040").create(app.db()).await;
    let staff = UserBuilder::new("+919000000041").staff().create(app.db()).await;
    let farmer_token = app.token_for(&farmer).await;
    let staff_token = app.token_for(&staff).await;

    let doc = json!({
        "title": "Rice blast management",
        "content": "Rice blast is a fungal disease. Spray tricyclazole at the first sign of leaf lesions. Avoid excess nitrogen fertilizer.",
        "source": "KAU package of practices",
        "language": "en"
    });
    let denied = app
        .post("/kb/ingest", &farmer_token)
        .json(&doc)
        .send()
        .await
        .unwrap();
    assert_eq!(denied.status(), StatusCode::FORBIDDEN);

    let ingested = app
        .post("/kb/ingest", &staff_token)
        .json(&doc)
        .send()
        .await
        .unwrap();
    assert_eq!(ingested.status(), StatusCode::CREATED);
    let ingested: Value = ingested.json().await.unwrap();
    assert!(ingested["chunks"].as_u64().unwrap() >= 1);

    let results: Value = app
        .get("/kb/search?q=rice%20blast%20spray&k=3", &farmer_token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(results["results"][0]["doc_id"], ingested["doc_id"]);

    let bad_k = app
        .get("/kb/search?q=rice&k=0", &farmer_token)
        .send()
        .await
        .unwrap();
    assert_eq!(bad_k.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_upload_and_serve_media() {
    let app = TestApp::spawn().await;
    let user = UserBuilder::new("+919000000050").create(app.db()).await;
    let token = app.token_for(&user).await;

    let resp = app
        .post("/uploads?filename=note.wav", &token)
        .body(vec![1u8, 2, 3, 4])
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CREATED);
    let upload: Value = resp.json().await.unwrap();
    assert_eq!(upload["kind"], "audio");
    assert_eq!(upload["size_bytes"], 4);

    let url = upload["url"].as_str().unwrap();
    assert!(url.ends_with(&format!("/media/{}", upload["id"].as_str().unwrap())));

    let served = app.client.get(url).bearer_auth(&token).send().await.unwrap();
    assert_eq!(served.status(), StatusCode::OK);
    assert_eq!(served.headers().get("content-type").unwrap(), "audio/wav");
    assert_eq!(served.bytes().await.unwrap().as_ref(), &[1u8, 2, 3, 4]);

    // Uploads are private
    let anonymous = app.client.get(url).send().await.unwrap();
    assert_eq!(anonymous.status(), StatusCode::UNAUTHORIZED);

    let stranger = UserBuilder::new("+919000000051").create(app.db()).await;
    let stranger_token = app.token_for(&stranger).await;
    let other = app
        .client
        .get(url)
        .bearer_auth(&stranger_token)
        .send()
        .await
        .unwrap();
    assert_eq!(other.status(), StatusCode::FORBIDDEN);

    let staff = UserBuilder::new("+919000000052").staff().create(app.db()).await;
    let staff_token = app.token_for(&staff).await;
    let as_staff = app
        .client
        .get(url)
        .bearer_auth(&staff_token)
        .send()
        .await
        .unwrap();
    assert_eq!(as_staff.status(), StatusCode::OK);

    let rejected = app
        .post("/uploads?filename=script.exe", &token)
        .body(vec![1u8])
        .send()
        .await
        .unwrap();
    assert_eq!(rejected.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_privacy_consent_export_and_erase() {
    let app = TestApp::spawn().await;
    let user = UserBuilder::new("+919000000060").create(app.db()).await;
    FarmerBuilder::new(&user.id).create(app.db()).await;
    let token = app.token_for(&user).await;

    let consent = app
        .post("/privacy/consents", &token)
        .json(&json!({"kind": "notifications", "granted": true}))
        .send()
        .await
        .unwrap();
    assert_eq!(consent.status(), StatusCode::CREATED);

    let consents: Value = app
        .get("/privacy/consents", &token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(consents["current"]["notifications"]["granted"], true);

    let export = app.get("/privacy/export", &token).send().await.unwrap();
    assert_eq!(export.status(), StatusCode::OK);
    let export: Value = export.json().await.unwrap();
    assert_eq!(export["farmer"]["name"], "Test Farmer");

    let unconfirmed = app
        .post("/privacy/erase", &token)
        .json(&json!({}))
        .send()
        .await
        .unwrap();
    assert_eq!(unconfirmed.status(), StatusCode::BAD_REQUEST);

    let erased: Value = app
        .post("/privacy/erase", &token)
        .json(&json!({"confirm": true}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(erased["farmer"], 1);

    // The account is deactivated, so the old token stops working
    let after = app.get("/auth/me", &token).send().await.unwrap();
    assert_eq!(after.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_admin_endpoints() {
    let app = TestApp::spawn().await;
    let admin = UserBuilder::new("+919000000070").admin().create(app.db()).await;
    let farmer = UserBuilder::new("+919000000071").create(app.db()).await;
    let admin_token = app.token_for(&admin).await;
    let farmer_token = app.token_for(&farmer).await;

    let denied = app.get("/admin/stats", &farmer_token).send().await.unwrap();
    assert_eq!(denied.status(), StatusCode::FORBIDDEN);

    let stats: Value = app
        .get("/admin/stats", &admin_token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(stats["stats"]["users"], 2);
    assert_eq!(stats["live_connections"], 0);

    let promoted: Value = app
        .patch(&format!("/admin/users/{}/role", farmer.id), &admin_token)
        .json(&json!({"role": "staff"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(promoted["role"], "staff");

    let logs: Value = app
        .get("/admin/audit-logs?action=update", &admin_token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(logs["total"], 1);
    assert_eq!(logs["audit_logs"][0]["target_id"], farmer.id.as_str());
}

#[tokio::test]
async fn test_activity_rejects_someone_elses_voice_note() {
    let app = TestApp::spawn().await;
    let alice = UserBuilder::new("+919000000080").create(app.db()).await;
    let bob = UserBuilder::new("+919000000081").create(app.db()).await;
    let (bob_farmer, _) = FarmerBuilder::new(&bob.id).create(app.db()).await;
    grant_consent(app.db(), &bob.id, ConsentKind::DataProcessing).await;
    let alice_token = app.token_for(&alice).await;
    let bob_token = app.token_for(&bob).await;

    let upload: Value = app
        .post("/uploads?filename=alice.wav", &alice_token)
        .body(vec![9u8; 16])
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    let resp = app
        .post("/activities/log", &bob_token)
        .json(&json!({
            "farmer_id": bob_farmer.id,
            "audio_media_id": upload["id"],
            "language": "en"
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);

    // Bob's own note is accepted
    let own: Value = app
        .post("/uploads?filename=bob.wav", &bob_token)
        .body(vec![7u8; 16])
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let resp = app
        .post("/activities/log", &bob_token)
        .json(&json!({
            "farmer_id": bob_farmer.id,
            "audio_media_id": own["id"],
            "language": "en"
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CREATED);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_refresh_has_one_winner() {
    let app = TestApp::spawn().await;
    let user = UserBuilder::new("+919000000090").create(app.db()).await;

    for _ in 0..5 {
        let pair = app.token_pair_for(&user).await;
        let body = json!({"refresh_token": pair.refresh_token});
        let (a, b) = tokio::join!(
            app.client.post(app.url("/auth/refresh")).json(&body).send(),
            app.client.post(app.url("/auth/refresh")).json(&body).send(),
        );
        let statuses = [a.unwrap().status(), b.unwrap().status()];
        let ok = statuses.iter().filter(|s| **s == StatusCode::OK).count();
        assert_eq!(ok, 1, "statuses: {:?}", statuses);
        assert!(statuses.contains(&StatusCode::UNAUTHORIZED));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_otp_verify_has_one_winner() {
    let app = TestApp::spawn().await;

    for round in 0..5 {
        let phone = format!("+91900000010{}", round);
        let started: Value = app
            .client
            .post(app.url("/auth/otp/start"))
            .json(&json!({"phone": phone}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let body = json!({"req_id": started["req_id"], "code": "000000"});
        let (a, b) = tokio::join!(
            app.client.post(app.url("/auth/otp/verify")).json(&body).send(),
            app.client.post(app.url("/auth/otp/verify")).json(&body).send(),
        );
        let statuses = [a.unwrap().status(), b.unwrap().status()];
        let ok = statuses.iter().filter(|s| **s == StatusCode::OK).count();
        assert_eq!(ok, 1, "statuses: {:?}", statuses);
    }
}

#[tokio::test]
async fn test_published_key_matches_token_header() {
    let app = TestApp::spawn().await;
    let user = UserBuilder::new("+919000000110").create(app.db()).await;
    let token = app.token_for(&user).await;

    let jwks: Value = app
        .client
        .get(app.url("/.well-known/jwks.json"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let key = &jwks["keys"][0];
    assert_eq!(key["use"], "sig");
    assert_eq!(key["alg"], "RS256");

    use base64ct::Encoding;
    let header: Value = serde_json::from_slice(
        &base64ct::Base64UrlUnpadded::decode_vec(token.split('.').next().unwrap()).unwrap(),
    )
    .unwrap();
    assert!(key["kid"].is_string());
    assert_eq!(header["kid"], key["kid"]);
}

#[tokio::test]
async fn test_malformed_json_gets_error_body() {
    let app = TestApp::spawn().await;

    let resp = app
        .client
        .post(app.url("/auth/otp/start"))
        .header("content-type", "application/json")
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "invalid_request");

    let user = UserBuilder::new("+919000000120").staff().create(app.db()).await;
    let token = app.token_for(&user).await;
    let resp = app.get("/kb/search?k=abc", &token).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["type"], "client_error");
}
