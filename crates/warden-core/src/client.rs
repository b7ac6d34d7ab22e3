//! Host side of the line-delimited JSON transport.

use std::io;

use tokio::{
    io::BufReader,
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
};
use warden_plugin_sdk::protocol::{
    read_line, write_message, ErrorCode, Request, Response, RpcError,
};

/// Single-connection RPC client. One request is in flight at a time; `&mut
/// self` on [`RpcClient::call`] enforces that.
#[derive(Debug)]
pub struct RpcClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    next_id: u64,
}

/// Outcome of a call that reached the plugin and got an answer back.
pub type Reply = Result<String, RpcError>;

impl RpcClient {
    pub async fn connect(addr: &str) -> io::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Self::from_stream(stream))
    }

    pub fn from_stream(stream: TcpStream) -> Self {
        let (read_half, writer) = stream.into_split();
        Self {
            reader: BufReader::new(read_half),
            writer,
            next_id: 1,
        }
    }

    /// Sends one request and waits for its response.
    ///
    /// The outer error is a transport failure: the connection is no longer
    /// usable. The inner error is the plugin's own answer.
    pub async fn call(&mut self, function: &str, payload: &str) -> io::Result<Reply> {
        let id = self.next_id;
        self.next_id += 1;

        write_message(&mut self.writer, &Request::new(id, function, payload)).await?;
        let line = read_line(&mut self.reader).await?.ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "plugin closed the connection before responding",
            )
        })?;
        let response: Response = serde_json::from_str(&line)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
        let response_id = response.id;
        let reply = response.into_result();
        // A plugin that cannot decode the request answers with id 0.
        let undecodable =
            response_id == 0 && matches!(&reply, Err(rpc) if rpc.code == ErrorCode::BadRequest);
        if response_id != id && !undecodable {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("response id {response_id} does not match request id {id}"),
            ));
        }
        Ok(reply)
    }
}

#[cfg(test)]
mod tests {
    use tokio::net::TcpListener;
    use warden_plugin_sdk::PluginServer;

    use super::*;

    async fn spawn_echo() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(PluginServer::new().register("Execute", Ok).serve(listener));
        addr
    }

    #[tokio::test]
    async fn successive_calls_are_paired() {
        let addr = spawn_echo().await;
        let mut client = RpcClient::connect(&addr).await.unwrap();
        assert_eq!(client.call("Execute", "one").await.unwrap().unwrap(), "one");
        assert_eq!(client.call("Execute", "two").await.unwrap().unwrap(), "two");
    }

    #[tokio::test]
    async fn plugin_errors_are_not_transport_errors() {
        let addr = spawn_echo().await;
        let mut client = RpcClient::connect(&addr).await.unwrap();
        let reply = client.call("Nope", "x").await.unwrap();
        assert_eq!(reply.unwrap_err().code, ErrorCode::UnknownFunction);
        assert_eq!(client.call("Execute", "still up").await.unwrap().unwrap(), "still up");
    }

    /// Answers the first request on one connection with `response`.
    async fn reply_once(response: Response) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read_half, mut write_half) = stream.into_split();
            let mut reader = BufReader::new(read_half);
            read_line(&mut reader).await.unwrap();
            write_message(&mut write_half, &response).await.unwrap();
        });
        addr
    }

    #[tokio::test]
    async fn mismatched_response_id_is_rejected() {
        let addr = reply_once(Response::ok(42, "stale")).await;
        let mut client = RpcClient::connect(&addr).await.unwrap();
        let err = client.call("Execute", "x").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn undecodable_request_reply_is_a_plugin_error() {
        let addr = reply_once(Response::err(0, ErrorCode::BadRequest, "invalid request")).await;
        let mut client = RpcClient::connect(&addr).await.unwrap();
        let rpc = client.call("Execute", "x").await.unwrap().unwrap_err();
        assert_eq!(rpc.code, ErrorCode::BadRequest);
        assert_eq!(rpc.message, "invalid request");
    }

    #[tokio::test]
    async fn id_zero_success_is_still_a_mismatch() {
        let addr = reply_once(Response::ok(0, "stray")).await;
        let mut client = RpcClient::connect(&addr).await.unwrap();
        let err = client.call("Execute", "x").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn closed_connection_is_unexpected_eof() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            drop(stream);
        });

        let mut client = RpcClient::connect(&addr).await.unwrap();
        let err = client.call("Execute", "x").await.unwrap_err();
        assert!(matches!(
            err.kind(),
            io::ErrorKind::UnexpectedEof | io::ErrorKind::ConnectionReset | io::ErrorKind::BrokenPipe
        ));
    }
}
