//! Wire-level properties of the message layer over an in-memory
//! channel: multi-frame data streams and the header size cap.

use zrepd::rpc::{Header, MessageLayer, Status, MAX_HEADER_LENGTH};

fn pipe() -> (MessageLayer, MessageLayer) {
	let (a, b) = tokio::io::duplex(1024 * 1024);
	let (ar, aw) = tokio::io::split(a);
	let (br, bw) = tokio::io::split(b);
	(
		MessageLayer::new(Box::new(ar), Box::new(aw)),
		MessageLayer::new(Box::new(br), Box::new(bw)),
	)
}

#[tokio::test]
async fn test_data_stream_spanning_multiple_frames() {
	// Larger than one frame payload, so the message layer has to split
	// the stream and the reader has to reassemble it.
	let size = 9 * 1024 * 1024 + 12345;
	let data: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
	let expected = data.clone();

	let (mut tx, mut rx) = pipe();
	let writer = tokio::spawn(async move {
		let mut src: &[u8] = &data;
		let total = tx.write_data(&mut src).await.unwrap();
		assert_eq!(total, size as u64);
	});
	let reader = tokio::spawn(async move {
		let mut out = Vec::with_capacity(size);
		rx.data_reader().read_to_end(&mut out).await.unwrap();
		out
	});

	writer.await.unwrap();
	let out = reader.await.unwrap();
	assert_eq!(out.len(), expected.len());
	assert_eq!(out, expected);
}

#[tokio::test]
async fn test_empty_data_stream() {
	let (mut tx, mut rx) = pipe();
	let writer = tokio::spawn(async move {
		tx.write_data_buf(&[]).await.unwrap();
	});
	let mut out = Vec::new();
	rx.data_reader().read_to_end(&mut out).await.unwrap();
	assert!(out.is_empty());
	writer.await.unwrap();
}

#[tokio::test]
async fn test_oversized_header_fails_on_write() {
	let (mut tx, _rx) = pipe();
	let h = Header {
		error: Status::ServerError,
		error_message: "x".repeat(MAX_HEADER_LENGTH + 1),
		..Header::default()
	};
	assert!(tx.write_header(&h).await.is_err());
}

#[tokio::test]
async fn test_sequential_messages_stay_aligned() {
	let (mut tx, mut rx) = pipe();
	let writer = tokio::spawn(async move {
		for i in 0..3u8 {
			let h = Header { endpoint: format!("ep{}", i), ..Header::default() };
			tx.write_header(&h).await.unwrap();
			tx.write_data_buf(&vec![i; 1000]).await.unwrap();
		}
	});

	for i in 0..3u8 {
		let h = rx.read_header().await.unwrap();
		assert_eq!(h.endpoint, format!("ep{}", i));
		let mut out = Vec::new();
		rx.data_reader().read_to_end(&mut out).await.unwrap();
		assert_eq!(out, vec![i; 1000]);
	}
	writer.await.unwrap();
}

// vim: ts=4
